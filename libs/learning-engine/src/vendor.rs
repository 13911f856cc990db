//! MAC-to-vendor lookup by OUI (the first three octets), used to populate a
//! newly created flow's `vendor` field when no device manager is present.
//!
//! This is a representative sample, not the full IEEE registry; a complete
//! table is a data-refresh concern for whatever feeds the device manager.

const TABLE: &[(&str, &str)] = &[
    ("00:1A:11", "Google"),
    ("3C:5A:B4", "Google"),
    ("F4:F5:D8", "Google"),
    ("AC:DE:48", "Apple"),
    ("F0:18:98", "Apple"),
    ("A4:83:E7", "Apple"),
    ("B8:27:EB", "Raspberry Pi Foundation"),
    ("DC:A6:32", "Raspberry Pi Foundation"),
    ("00:0C:29", "VMware"),
    ("00:50:56", "VMware"),
    ("00:1B:63", "Amazon"),
    ("74:C2:46", "Amazon"),
    ("EC:B5:FA", "Samsung"),
    ("5C:0A:5B", "Samsung"),
    ("00:17:88", "Philips Hue"),
];

/// Looks up the vendor for a MAC address given as colon-separated hex
/// (any case). Returns `None` on an OUI not in the table.
pub fn lookup(mac: &str) -> Option<&'static str> {
    let mut parts = mac.splitn(4, ':');
    let oui = format!(
        "{}:{}:{}",
        parts.next()?.to_uppercase(),
        parts.next()?.to_uppercase(),
        parts.next()?.to_uppercase()
    );
    TABLE
        .iter()
        .find(|(prefix, _)| *prefix == oui)
        .map(|(_, vendor)| *vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_oui_matches_case_insensitively() {
        assert_eq!(lookup("ac:de:48:01:02:03"), Some("Apple"));
        assert_eq!(lookup("AC:DE:48:01:02:03"), Some("Apple"));
    }

    #[test]
    fn unknown_oui_is_none() {
        assert_eq!(lookup("00:00:00:01:02:03"), None);
    }
}
