//! Extraction of the TLS `server_name` extension from a TCP payload believed
//! to carry a Client Hello. Hand-rolled rather than pulled in from a full TLS
//! stack: we only ever need to peek at one extension of one handshake
//! message, never to actually speak TLS.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Returns the SNI host name carried in a TLS 1.x Client Hello, or an empty
/// string if `payload` isn't one, is truncated, or carries no `server_name`
/// extension.
pub fn extract_sni(payload: &[u8]) -> String {
    try_extract_sni(payload).unwrap_or_default()
}

fn try_extract_sni(payload: &[u8]) -> Option<String> {
    let mut r = Reader::new(payload);

    // TLS record header: content type (1), version (2), length (2).
    if r.take_u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    r.skip(2)?; // legacy record version
    let record_len = r.take_u16()? as usize;
    let record = r.take(record_len)?;

    let mut r = Reader::new(record);
    // Handshake header: msg type (1), length (3).
    if r.take_u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let hs_len = r.take_u24()?;
    let hs_body = r.take(hs_len)?;

    let mut r = Reader::new(hs_body);
    r.skip(2)?; // client_version
    r.skip(32)?; // random

    let session_id_len = r.take_u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_suites_len = r.take_u16()? as usize;
    r.skip(cipher_suites_len)?;

    let compression_len = r.take_u8()? as usize;
    r.skip(compression_len)?;

    // Extensions are optional; absence means no SNI.
    let extensions_len = r.take_u16()? as usize;
    let mut ext = Reader::new(r.take(extensions_len)?);

    while !ext.is_empty() {
        let ext_type = ext.take_u16()?;
        let ext_len = ext.take_u16()? as usize;
        let ext_body = ext.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(ext_body);
        }
    }

    None
}

fn parse_server_name_extension(body: &[u8]) -> Option<String> {
    let mut r = Reader::new(body);
    let list_len = r.take_u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.take_u8()?;
        let name_len = list.take_u16()? as usize;
        let name = list.take(name_len)?;

        if name_type == SERVER_NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name).ok().map(str::to_owned);
        }
    }

    None
}

/// A tiny cursor over a byte slice, returning `None` instead of panicking on
/// underrun.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16be(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }

    fn u24be(n: usize) -> [u8; 3] {
        [(n >> 16) as u8, (n >> 8) as u8, n as u8]
    }

    /// Builds a minimal, well-formed Client Hello record carrying exactly one
    /// SNI host name extension.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let mut server_name_list = Vec::new();
        server_name_list.push(SERVER_NAME_TYPE_HOST_NAME);
        server_name_list.extend_from_slice(&u16be(host.len() as u16));
        server_name_list.extend_from_slice(host.as_bytes());

        let mut sni_ext_body = Vec::new();
        sni_ext_body.extend_from_slice(&u16be(server_name_list.len() as u16));
        sni_ext_body.extend_from_slice(&server_name_list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&u16be(EXTENSION_SERVER_NAME));
        extensions.extend_from_slice(&u16be(sni_ext_body.len() as u16));
        extensions.extend_from_slice(&sni_ext_body);

        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&u16be(2)); // cipher suites len
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&u16be(extensions.len() as u16));
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        handshake.extend_from_slice(&u24be(body.len()));
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[3, 1]); // legacy record version
        record.extend_from_slice(&u16be(handshake.len() as u16));
        record.extend_from_slice(&handshake);

        record
    }

    #[test]
    fn extracts_hostname_from_well_formed_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record), "example.com");
    }

    #[test]
    fn non_handshake_content_type_yields_empty() {
        let mut record = client_hello_with_sni("example.com");
        record[0] = 0x17; // application data, not handshake
        assert_eq!(extract_sni(&record), "");
    }

    #[test]
    fn truncated_record_yields_empty_not_panic() {
        let record = client_hello_with_sni("example.com");
        for len in 0..record.len() {
            assert_eq!(extract_sni(&record[..len]), "");
        }
    }

    #[test]
    fn empty_payload_yields_empty() {
        assert_eq!(extract_sni(&[]), "");
    }
}
