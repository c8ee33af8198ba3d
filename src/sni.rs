//! TLS ClientHello inspection for the sender listener.
//!
//! The sender's handshake is parsed, never terminated: the listener only
//! needs the `server_name` extension to route the connection, and the bytes
//! themselves travel on to the receiver untouched. Parsing is a pure
//! function of the input; anything malformed simply yields no SNI.

const TLS_RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Verdict on a peeked prefix of a sender connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Peek {
    /// More bytes are needed; wait until `want` are buffered in total.
    NeedMore(usize),
    /// The prefix can never be a TLS handshake record.
    NotTls,
    /// The whole record (or as much as fits the peek window) is available.
    Ready,
}

/// Decides whether `buf` holds enough of the leading TLS record to parse.
/// `window` caps how many bytes the caller is able to peek.
pub fn classify(buf: &[u8], window: usize) -> Peek {
    if buf.len() < TLS_RECORD_HEADER_LEN {
        return Peek::NeedMore(TLS_RECORD_HEADER_LEN);
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE || u16::from_be_bytes([buf[1], buf[2]]) < 0x0301 {
        return Peek::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let want = (TLS_RECORD_HEADER_LEN + record_len).min(window);
    if buf.len() < want {
        Peek::NeedMore(want)
    } else {
        Peek::Ready
    }
}

/// Extracts the first `host_name` entry of the `server_name` extension from
/// a buffer starting at a TLS ClientHello record. Returns `None` for
/// anything that is not a well-formed ClientHello carrying an SNI.
pub fn extract_sni(data: &[u8]) -> Option<&str> {
    let mut record = Bytes::new(data);
    let content_type = record.u8()?;
    let version = record.u16()?;
    if content_type != CONTENT_TYPE_HANDSHAKE || version < 0x0301 {
        return None;
    }
    // Record length; the peek window may truncate the body, in which case
    // walking below runs out of bytes and yields None.
    let _record_len = record.u16()?;

    if record.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _handshake_len = record.u24()?;
    let _client_version = record.u16()?;
    record.skip(32)?; // client random

    let session_id_len = record.u8()? as usize;
    record.skip(session_id_len)?;
    let cipher_suites_len = record.u16()? as usize;
    record.skip(cipher_suites_len)?;
    let compression_len = record.u8()? as usize;
    record.skip(compression_len)?;

    let extensions_len = record.u16()? as usize;
    let mut extensions = Bytes::new(record.slice(extensions_len)?);
    while let Some(extension_type) = extensions.u16() {
        let extension_len = extensions.u16()? as usize;
        let body = extensions.slice(extension_len)?;
        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut names = Bytes::new(body);
        let _list_len = names.u16()?;
        if names.u8()? != NAME_TYPE_HOST_NAME {
            return None;
        }
        let name_len = names.u16()? as usize;
        let host = names.slice(name_len)?;
        return std::str::from_utf8(host).ok().filter(|h| !h.is_empty());
    }
    None
}

/// Bounds-checked cursor over the hello bytes.
struct Bytes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Bytes<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.slice(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.slice(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.slice(len).map(|_| ())
    }

    fn slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}

/// Builds a minimal ClientHello record for tests across the crate. `host`
/// lands in the SNI extension; `None` produces a hello with no extensions.
#[cfg(test)]
pub(crate) fn test_client_hello(host: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client version
    body.extend_from_slice(&[0x42; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    body.extend_from_slice(&[0x01, 0x00]); // null compression

    let mut extensions = Vec::new();
    if let Some(host) = host {
        let name = host.as_bytes();
        let mut entry = Vec::new();
        entry.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        entry.push(0); // host_name
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);
        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&entry);
    }
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&[
        (body.len() >> 16) as u8,
        (body.len() >> 8) as u8,
        body.len() as u8,
    ]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
