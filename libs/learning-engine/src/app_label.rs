//! Domain-suffix → application name table, matched by longest dotted
//! suffix. Used to label a flow from its SNI-derived hostname.

const TABLE: &[(&str, &str)] = &[
    ("netflix.com", "Netflix"),
    ("nflxvideo.net", "Netflix"),
    ("youtube.com", "YouTube"),
    ("googlevideo.com", "YouTube"),
    ("google.com", "Google"),
    ("gstatic.com", "Google"),
    ("apple.com", "Apple"),
    ("icloud.com", "iCloud"),
    ("zoom.us", "Zoom"),
    ("teams.microsoft.com", "Microsoft Teams"),
    ("microsoft.com", "Microsoft"),
    ("spotify.com", "Spotify"),
    ("steamcontent.com", "Steam"),
    ("steampowered.com", "Steam"),
];

/// Returns the application label for `domain` by longest matching dotted
/// suffix, e.g. `"www.netflix.com"` and `"netflix.com"` both match the
/// `"netflix.com"` entry, but `"notnetflix.com"` does not.
pub fn lookup(domain: &str) -> Option<&'static str> {
    let domain = domain.trim_end_matches('.').to_lowercase();
    TABLE
        .iter()
        .filter(|(suffix, _)| domain == *suffix || domain.ends_with(&format!(".{suffix}")))
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(_, label)| *label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_subdomain_match() {
        assert_eq!(lookup("netflix.com"), Some("Netflix"));
        assert_eq!(lookup("www.netflix.com"), Some("Netflix"));
        assert_eq!(lookup("api.prod.netflix.com"), Some("Netflix"));
    }

    #[test]
    fn suffix_must_be_dot_aligned() {
        assert_eq!(lookup("notnetflix.com"), None);
    }

    #[test]
    fn longest_suffix_wins() {
        // teams.microsoft.com is more specific than microsoft.com
        assert_eq!(lookup("teams.microsoft.com"), Some("Microsoft Teams"));
        assert_eq!(lookup("outlook.microsoft.com"), Some("Microsoft"));
    }

    #[test]
    fn unknown_domain_is_none() {
        assert_eq!(lookup("example.org"), None);
    }
}
