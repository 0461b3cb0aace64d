//! Binary codec of the multicast discovery packets.
//!
//! Little-endian layout:
//! * u8 format version (current = 3)
//! * u8 packet kind (1 = heart-beat, 2 = last-beat)
//! * heart-beat: u16 port, then `path`, `peer_uid`, `node_uid`, `app_id`
//!   as length-prefixed UTF-8 strings (u16 length + bytes)
//! * last-beat: `peer_uid`, `app_id` as length-prefixed strings

use bytes::{Buf, BufMut, BytesMut};

use herald_core::HeraldError;

/// Current packet format version.
pub const PACKET_FORMAT_VERSION: u8 = 3;

/// Heart-beat packet kind.
pub const PACKET_TYPE_HEARTBEAT: u8 = 1;

/// Last-beat packet kind: the peer is going away.
pub const PACKET_TYPE_LASTBEAT: u8 = 2;

/// A decoded discovery packet. The format version is kept so receivers can
/// drop unsupported revisions without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Heartbeat {
        version: u8,
        port: u16,
        path: String,
        peer_uid: String,
        node_uid: String,
        app_id: String,
    },
    LastBeat {
        version: u8,
        peer_uid: String,
        app_id: String,
    },
}

impl Packet {
    pub fn version(&self) -> u8 {
        match self {
            Packet::Heartbeat { version, .. } => *version,
            Packet::LastBeat { version, .. } => *version,
        }
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_string(buf: &mut &[u8]) -> Result<String, HeraldError> {
    if buf.remaining() < 2 {
        return Err(HeraldError::Malformed("truncated string length".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(HeraldError::Malformed("truncated string body".into()));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| HeraldError::Malformed("string is not UTF-8".into()))
}

/// Builds a heart-beat packet announcing the local HTTP endpoint.
pub fn encode_heartbeat(
    port: u16,
    path: &str,
    peer_uid: &str,
    node_uid: &str,
    app_id: &str,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(PACKET_FORMAT_VERSION);
    buf.put_u8(PACKET_TYPE_HEARTBEAT);
    buf.put_u16_le(port);
    for value in [path, peer_uid, node_uid, app_id] {
        put_string(&mut buf, value);
    }
    buf.to_vec()
}

/// Builds the farewell packet sent right before shutdown.
pub fn encode_lastbeat(peer_uid: &str, app_id: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(PACKET_FORMAT_VERSION);
    buf.put_u8(PACKET_TYPE_LASTBEAT);
    for value in [peer_uid, app_id] {
        put_string(&mut buf, value);
    }
    buf.to_vec()
}

/// Parses a datagram. Unknown kinds and truncated payloads are rejected;
/// version acceptance is the receiver's call.
pub fn decode(data: &[u8]) -> Result<Packet, HeraldError> {
    let mut buf = data;
    if buf.remaining() < 2 {
        return Err(HeraldError::Malformed("packet too short".into()));
    }
    let version = buf.get_u8();
    let kind = buf.get_u8();
    match kind {
        PACKET_TYPE_HEARTBEAT => {
            if buf.remaining() < 2 {
                return Err(HeraldError::Malformed("heart-beat without port".into()));
            }
            let port = buf.get_u16_le();
            let path = get_string(&mut buf)?;
            let peer_uid = get_string(&mut buf)?;
            let node_uid = get_string(&mut buf)?;
            let app_id = get_string(&mut buf)?;
            Ok(Packet::Heartbeat {
                version,
                port,
                path,
                peer_uid,
                node_uid,
                app_id,
            })
        }
        PACKET_TYPE_LASTBEAT => {
            let peer_uid = get_string(&mut buf)?;
            let app_id = get_string(&mut buf)?;
            Ok(Packet::LastBeat {
                version,
                peer_uid,
                app_id,
            })
        }
        other => Err(HeraldError::Malformed(format!("unknown packet kind {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trip() {
        let raw = encode_heartbeat(8001, "/herald", "aaa", "node-1", "demo");
        let packet = decode(&raw).unwrap();
        assert_eq!(
            packet,
            Packet::Heartbeat {
                version: PACKET_FORMAT_VERSION,
                port: 8001,
                path: "/herald".to_string(),
                peer_uid: "aaa".to_string(),
                node_uid: "node-1".to_string(),
                app_id: "demo".to_string(),
            }
        );
    }

    #[test]
    fn lastbeat_round_trip() {
        let raw = encode_lastbeat("aaa", "demo");
        let packet = decode(&raw).unwrap();
        assert_eq!(
            packet,
            Packet::LastBeat {
                version: PACKET_FORMAT_VERSION,
                peer_uid: "aaa".to_string(),
                app_id: "demo".to_string(),
            }
        );
    }

    #[test]
    fn fixed_heartbeat_bytes_decode() {
        // version 1, kind heart-beat, port 8000, "/path", "aaa", "n-1", "demo"
        let raw: Vec<u8> = vec![
            0x01, 0x01, 0x40, 0x1F, //
            0x05, 0x00, b'/', b'p', b'a', b't', b'h', //
            0x03, 0x00, b'a', b'a', b'a', //
            0x03, 0x00, b'n', b'-', b'1', //
            0x04, 0x00, b'd', b'e', b'm', b'o',
        ];
        let packet = decode(&raw).unwrap();
        assert_eq!(
            packet,
            Packet::Heartbeat {
                version: 1,
                port: 8000,
                path: "/path".to_string(),
                peer_uid: "aaa".to_string(),
                node_uid: "n-1".to_string(),
                app_id: "demo".to_string(),
            }
        );
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let raw = encode_heartbeat(8001, "/herald", "aaa", "node-1", "demo");
        for cut in [0, 1, 3, 5, raw.len() - 1] {
            assert!(decode(&raw[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(decode(&[PACKET_FORMAT_VERSION, 9, 0, 0]).is_err());
    }

    #[test]
    fn unicode_strings_survive() {
        let raw = encode_heartbeat(9, "/héraut", "pair-é", "nœud", "démo");
        match decode(&raw).unwrap() {
            Packet::Heartbeat {
                path,
                peer_uid,
                node_uid,
                app_id,
                ..
            } => {
                assert_eq!(path, "/héraut");
                assert_eq!(peer_uid, "pair-é");
                assert_eq!(node_uid, "nœud");
                assert_eq!(app_id, "démo");
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
