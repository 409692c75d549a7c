//! Wire codec for the registry protocol.
//!
//! Every frame starts with a one-byte tag. Integers are big-endian. String
//! fields carry no length prefix: each is written with a trailing NUL and
//! read back by scanning for that NUL within
//! `min(MAX_FILENAME_LEN, remaining)` bytes. A string with no NUL inside the
//! bound is taken to be the whole bound, and the cursor always skips one
//! terminator byte after it. Peers in the field depend on this exact layout.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::utils::{P2PError, Result};

/// Upper bound used when scanning a string field for its terminator.
pub const MAX_FILENAME_LEN: usize = 100;
/// Files a peer is expected to publish at once; sizes the registry buffer.
pub const MAX_FILES: usize = 10;
/// Default bounded receive buffer for one registry read.
pub const RECV_BUFFER_SIZE: usize = 1024 + MAX_FILES * MAX_FILENAME_LEN;
/// A search response is always exactly this long.
pub const SEARCH_RESPONSE_LEN: usize = 10;
/// Longest possible Fetch frame: tag, bounded name, terminator.
pub const MAX_FETCH_FRAME_LEN: usize = 1 + MAX_FILENAME_LEN + 1;

/// Status byte written ahead of the file bytes on a data connection.
pub const FETCH_OK: u8 = 0;
pub const FETCH_ERROR: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Join = 0,
    Publish = 1,
    Search = 2,
    Fetch = 3,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Tag::Join),
            1 => Some(Tag::Publish),
            2 => Some(Tag::Search),
            3 => Some(Tag::Fetch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Join { peer_id: u32 },
    Publish { filenames: Vec<String> },
    Search { term: String },
    Fetch { filename: String },
}

impl Packet {
    pub fn tag(&self) -> Tag {
        match self {
            Packet::Join { .. } => Tag::Join,
            Packet::Publish { .. } => Tag::Publish,
            Packet::Search { .. } => Tag::Search,
            Packet::Fetch { .. } => Tag::Fetch,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Join { peer_id } => {
                let mut buf = Vec::with_capacity(5);
                buf.push(Tag::Join as u8);
                buf.extend_from_slice(&peer_id.to_be_bytes());
                buf
            }
            Packet::Publish { filenames } => {
                let body: usize = filenames.iter().map(|f| f.len() + 1).sum();
                let mut buf = Vec::with_capacity(5 + body);
                buf.push(Tag::Publish as u8);
                buf.extend_from_slice(&(filenames.len() as u32).to_be_bytes());
                for filename in filenames {
                    put_cstr(&mut buf, filename);
                }
                buf
            }
            Packet::Search { term } => {
                let mut buf = Vec::with_capacity(term.len() + 2);
                buf.push(Tag::Search as u8);
                put_cstr(&mut buf, term);
                buf
            }
            Packet::Fetch { filename } => {
                let mut buf = Vec::with_capacity(filename.len() + 2);
                buf.push(Tag::Fetch as u8);
                put_cstr(&mut buf, filename);
                buf
            }
        }
    }

    /// Decode a buffer holding exactly one frame. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_frame(data).map(|(packet, _)| packet)
    }

    /// Decode the frame at the front of `data` and return it together with
    /// the number of bytes it occupied. The consumed count may exceed
    /// `data.len()` by one when the final string had no terminator.
    pub fn decode_frame(data: &[u8]) -> Result<(Self, usize)> {
        let (&tag_byte, _) = data
            .split_first()
            .ok_or_else(|| P2PError::MalformedPacket("empty frame".to_string()))?;
        let tag = Tag::from_u8(tag_byte)
            .ok_or_else(|| P2PError::MalformedPacket(format!("unknown tag {}", tag_byte)))?;

        match tag {
            Tag::Join => {
                let peer_id = read_u32(data, 1, "join")?;
                Ok((Packet::Join { peer_id }, 5))
            }
            Tag::Publish => {
                let count = read_u32(data, 1, "publish")?;
                let mut offset = 5;
                // Every entry consumes at least one byte, so a bogus count
                // runs out of buffer instead of allocating.
                let mut filenames = Vec::new();
                for _ in 0..count {
                    let (filename, next) = scan_cstr(data, offset, "publish filename")?;
                    filenames.push(filename);
                    offset = next;
                }
                Ok((Packet::Publish { filenames }, offset))
            }
            Tag::Search => {
                let (term, next) = scan_cstr(data, 1, "search term")?;
                Ok((Packet::Search { term }, next))
            }
            Tag::Fetch => {
                let (filename, next) = scan_cstr(data, 1, "fetch filename")?;
                Ok((Packet::Fetch { filename }, next))
            }
        }
    }
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn read_u32(data: &[u8], offset: usize, what: &str) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| {
            P2PError::MalformedPacket(format!(
                "{} frame too short: {} bytes",
                what,
                data.len()
            ))
        })
}

/// strnlen-style scan starting at `offset`. Returns the string and the
/// offset just past its terminator slot.
fn scan_cstr(data: &[u8], offset: usize, what: &str) -> Result<(String, usize)> {
    let remaining = data.len().saturating_sub(offset);
    if remaining == 0 {
        return Err(P2PError::MalformedPacket(format!(
            "no bytes left for {} at offset {}",
            what, offset
        )));
    }

    let window = &data[offset..offset + remaining.min(MAX_FILENAME_LEN)];
    let len = window.iter().position(|&b| b == 0).unwrap_or(window.len());
    let s = String::from_utf8_lossy(&window[..len]).to_string();

    Ok((s, offset + len + 1))
}

/// Registry answer to a Search. `peer_id == 0` means "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchResponse {
    pub peer_id: u32,
    /// IPv4 address exactly as it sits in the socket address structure,
    /// i.e. octets in network order reinterpreted as a native integer.
    pub ip: u32,
    pub port: u16,
}

impl SearchResponse {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(peer_id: u32, addr: SocketAddrV4) -> Self {
        Self {
            peer_id,
            ip: u32::from_ne_bytes(addr.ip().octets()),
            port: addr.port(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.peer_id != 0
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.to_ne_bytes())
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ipv4(), self.port)
    }

    pub fn encode(&self) -> [u8; SEARCH_RESPONSE_LEN] {
        let mut buf = [0u8; SEARCH_RESPONSE_LEN];
        buf[0..4].copy_from_slice(&self.peer_id.to_be_bytes());
        // Passed through untouched; already in network order.
        buf[4..8].copy_from_slice(&self.ip.to_ne_bytes());
        buf[8..10].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != SEARCH_RESPONSE_LEN {
            return Err(P2PError::InvalidResponse(format!(
                "search response must be {} bytes, got {}",
                SEARCH_RESPONSE_LEN,
                data.len()
            )));
        }

        Ok(Self {
            peer_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            ip: u32::from_ne_bytes([data[4], data[5], data[6], data[7]]),
            port: u16::from_be_bytes([data[8], data[9]]),
        })
    }
}

/// Outcome of draining a data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub error: bool,
    pub bytes: Vec<u8>,
}

impl FetchResult {
    pub fn failed() -> Self {
        Self {
            error: true,
            bytes: Vec::new(),
        }
    }

    /// Interpret everything a serving peer sent before closing: one status
    /// byte followed by the raw file contents.
    pub fn from_stream(mut raw: Vec<u8>) -> Self {
        match raw.first().copied() {
            Some(FETCH_OK) => {
                raw.remove(0);
                Self {
                    error: false,
                    bytes: raw,
                }
            }
            _ => Self::failed(),
        }
    }
}

/// Space-separated hex dump of a frame, for debug logging.
pub fn dump_frame(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let encoded = packet.encode();
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_join_layout() {
        let encoded = Packet::Join { peer_id: 0x01020304 }.encode();
        assert_eq!(encoded, vec![0, 1, 2, 3, 4]);
        roundtrip(Packet::Join { peer_id: u32::MAX });
    }

    #[test]
    fn test_publish_layout() {
        let packet = Packet::Publish {
            filenames: vec!["a.txt".to_string(), "b".to_string()],
        };
        let encoded = packet.encode();
        assert_eq!(
            encoded,
            vec![1, 0, 0, 0, 2, b'a', b'.', b't', b'x', b't', 0, b'b', 0]
        );
        roundtrip(packet);
    }

    #[test]
    fn test_empty_publish() {
        let packet = Packet::Publish { filenames: vec![] };
        assert_eq!(packet.encode(), vec![1, 0, 0, 0, 0]);
        roundtrip(packet);
    }

    #[test]
    fn test_search_and_fetch_roundtrip() {
        roundtrip(Packet::Search {
            term: "notes.md".to_string(),
        });
        roundtrip(Packet::Fetch {
            filename: "notes.md".to_string(),
        });
        roundtrip(Packet::Search {
            term: String::new(),
        });
    }

    #[test]
    fn test_term_at_scan_bound() {
        let term = "x".repeat(MAX_FILENAME_LEN);
        let packet = Packet::Search { term };
        let encoded = packet.encode();
        let (decoded, consumed) = Packet::decode_frame(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_overlong_name_is_truncated_at_bound() {
        let long = "y".repeat(MAX_FILENAME_LEN + 5);
        let encoded = Packet::Fetch { filename: long }.encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Fetch { filename } => assert_eq!(filename.len(), MAX_FILENAME_LEN),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_final_string() {
        let data = [2u8, b'a', b'b', b'c'];
        assert_eq!(
            Packet::decode(&data).unwrap(),
            Packet::Search {
                term: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[9, 0, 0]).is_err());
        assert!(Packet::decode(&[0, 1, 2]).is_err());
        assert!(Packet::decode(&[2]).is_err());
        // Count promises two names, buffer holds one.
        assert!(Packet::decode(&[1, 0, 0, 0, 2, b'a', 0]).is_err());
    }

    #[test]
    fn test_coalesced_frames() {
        let mut data = Packet::Join { peer_id: 7 }.encode();
        data.extend(
            Packet::Publish {
                filenames: vec!["one".to_string()],
            }
            .encode(),
        );

        let (first, used) = Packet::decode_frame(&data).unwrap();
        assert_eq!(first, Packet::Join { peer_id: 7 });
        let (second, rest) = Packet::decode_frame(&data[used..]).unwrap();
        assert_eq!(
            second,
            Packet::Publish {
                filenames: vec!["one".to_string()]
            }
        );
        assert_eq!(used + rest, data.len());
    }

    #[test]
    fn test_search_response_layout() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 0x1f90);
        let response = SearchResponse::found(5, addr);
        let encoded = response.encode();
        assert_eq!(encoded, [0, 0, 0, 5, 10, 0, 0, 7, 0x1f, 0x90]);

        let decoded = SearchResponse::decode(&encoded).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.socket_addr(), addr);
        assert!(decoded.is_found());
    }

    #[test]
    fn test_search_response_sentinel() {
        let encoded = SearchResponse::not_found().encode();
        assert_eq!(encoded, [0u8; SEARCH_RESPONSE_LEN]);
        assert!(!SearchResponse::decode(&encoded).unwrap().is_found());
        assert!(SearchResponse::decode(&encoded[..9]).is_err());
    }

    #[test]
    fn test_fetch_result_from_stream() {
        let ok = FetchResult::from_stream(vec![FETCH_OK, b'h', b'i']);
        assert!(!ok.error);
        assert_eq!(ok.bytes, b"hi");

        assert!(FetchResult::from_stream(vec![FETCH_ERROR]).error);
        assert!(FetchResult::from_stream(Vec::new()).error);
    }
}
