use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;

/// All numbers on the wire are big-endian. Every packet starts with a
///  2-byte opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    Oack,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Opcode> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Opcode::Rrq => 1,
            Opcode::Wrq => 2,
            Opcode::Data => 3,
            Opcode::Ack => 4,
            Opcode::Error => 5,
            Opcode::Oack => 6,
        }
    }
}

/// The payload of an RRQ or WRQ: filename verbatim, mode and option names
///  lowercased during decode, option values as sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub filename: String,
    pub mode: String,
    pub options: FxHashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
    /// Echoed options in negotiation order.
    Oack { options: Vec<(String, String)> },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq(_) => Opcode::Rrq,
            Packet::Wrq(_) => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.opcode().as_u16());
        match self {
            Packet::Rrq(request) | Packet::Wrq(request) => {
                put_zstring(buf, &request.filename);
                put_zstring(buf, &request.mode);
                for (name, value) in &request.options {
                    put_zstring(buf, name);
                    put_zstring(buf, value);
                }
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(*code);
                put_zstring(buf, message);
            }
            Packet::Oack { options } => {
                for (name, value) in options {
                    put_zstring(buf, name);
                    put_zstring(buf, value);
                }
            }
        }
    }

    /// Decoding is tolerant where RFC practice requires it: trailing bytes
    ///  after ACK and ERROR fields are ignored, a missing option value
    ///  decodes as the empty string, and an ERROR message without its
    ///  trailing NUL is accepted.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let raw_opcode = buf.try_get_u16()?;
        let opcode = match Opcode::from_u16(raw_opcode) {
            Some(opcode) => opcode,
            None => anyhow::bail!("unknown opcode {}", raw_opcode),
        };
        let mut rest = buf.copy_to_bytes(buf.remaining());

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = match take_zstring(&mut rest)? {
                    Some(s) => s,
                    None => anyhow::bail!("request without terminated filename"),
                };
                let mode = match take_zstring(&mut rest)? {
                    Some(s) => s.to_ascii_lowercase(),
                    None => anyhow::bail!("request without terminated mode"),
                };
                let mut options = FxHashMap::default();
                while let Some(name) = take_field(&mut rest)? {
                    let value = take_field(&mut rest)?.unwrap_or_default();
                    options.insert(name.to_ascii_lowercase(), value);
                }
                let request = Request { filename, mode, options };
                match opcode {
                    Opcode::Rrq => Ok(Packet::Rrq(request)),
                    _ => Ok(Packet::Wrq(request)),
                }
            }
            Opcode::Data => {
                let block = rest.try_get_u16()?;
                Ok(Packet::Data { block, payload: rest.to_vec() })
            }
            Opcode::Ack => {
                let block = rest.try_get_u16()?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                let code = rest.try_get_u16()?;
                let message = take_field(&mut rest)?.unwrap_or_default();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => {
                let mut options = Vec::new();
                while let Some(name) = take_field(&mut rest)? {
                    let value = take_field(&mut rest)?.unwrap_or_default();
                    options.push((name.to_ascii_lowercase(), value));
                }
                Ok(Packet::Oack { options })
            }
        }
    }
}

fn put_zstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Takes the bytes up to (and consuming) the next NUL. `Ok(None)` when no
///  NUL remains.
fn take_zstring(rest: &mut Bytes) -> anyhow::Result<Option<String>> {
    let pos = match rest.iter().position(|&b| b == 0) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let raw = rest.split_to(pos);
    rest.advance(1);
    Ok(Some(String::from_utf8(raw.to_vec())?))
}

/// Like [`take_zstring`], but an unterminated tail is taken as the field
///  and an exhausted buffer ends the field list.
fn take_field(rest: &mut Bytes) -> anyhow::Result<Option<String>> {
    if !rest.has_remaining() {
        return Ok(None);
    }
    if let Some(s) = take_zstring(rest)? {
        return Ok(Some(s));
    }
    let raw = rest.split_to(rest.len());
    Ok(Some(String::from_utf8(raw.to_vec())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ser(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    #[rstest]
    #[case::data(Packet::Data { block: 0x1234, payload: b"abc".to_vec() }, vec![0,3, 0x12,0x34, b'a',b'b',b'c'])]
    #[case::data_empty(Packet::Data { block: 2, payload: vec![] }, vec![0,3, 0,2])]
    #[case::ack(Packet::Ack { block: 0x102f }, vec![0,4, 0x10,0x2f])]
    #[case::error(Packet::Error { code: 1, message: "File not found".to_string() },
        vec![0,5, 0,1, b'F',b'i',b'l',b'e',b' ',b'n',b'o',b't',b' ',b'f',b'o',b'u',b'n',b'd', 0])]
    #[case::oack(Packet::Oack { options: vec![("blksize".to_string(), "1024".to_string())] },
        vec![0,6, b'b',b'l',b'k',b's',b'i',b'z',b'e',0, b'1',b'0',b'2',b'4',0])]
    fn test_ser(#[case] packet: Packet, #[case] expected: Vec<u8>) {
        assert_eq!(ser(&packet), expected);
    }

    #[rstest]
    #[case::data(vec![0,3, 0,1, b'h',b'i'], Packet::Data { block: 1, payload: b"hi".to_vec() })]
    #[case::ack(vec![0,4, 0,7], Packet::Ack { block: 7 })]
    #[case::ack_trailing_ignored(vec![0,4, 0,7, 9,9,9], Packet::Ack { block: 7 })]
    #[case::error(vec![0,5, 0,2, b'n',b'o',0], Packet::Error { code: 2, message: "no".to_string() })]
    #[case::error_unterminated(vec![0,5, 0,2, b'n',b'o'], Packet::Error { code: 2, message: "no".to_string() })]
    #[case::error_empty_message(vec![0,5, 0,0], Packet::Error { code: 0, message: String::new() })]
    fn test_deser(#[case] raw: Vec<u8>, #[case] expected: Packet) {
        let packet = Packet::deser(&mut raw.as_slice()).unwrap();
        assert_eq!(packet, expected);
    }

    #[test]
    fn test_deser_rrq_without_options() {
        let raw = b"\x00\x01hi.txt\0OCTET\0";
        let packet = Packet::deser(&mut raw.as_slice()).unwrap();
        match packet {
            Packet::Rrq(request) => {
                assert_eq!(request.filename, "hi.txt");
                assert_eq!(request.mode, "octet");
                assert!(request.options.is_empty());
            }
            other => panic!("expected RRQ, got {:?}", other),
        }
    }

    #[test]
    fn test_deser_wrq_with_options() {
        let raw = b"\x00\x02up.bin\0octet\0BLKSIZE\x001024\0tsize\x002000\0";
        let packet = Packet::deser(&mut raw.as_slice()).unwrap();
        match packet {
            Packet::Wrq(request) => {
                assert_eq!(request.filename, "up.bin");
                assert_eq!(request.mode, "octet");
                assert_eq!(request.options.get("blksize").map(String::as_str), Some("1024"));
                assert_eq!(request.options.get("tsize").map(String::as_str), Some("2000"));
            }
            other => panic!("expected WRQ, got {:?}", other),
        }
    }

    #[test]
    fn test_deser_rrq_option_without_value() {
        // a trailing option name with no value decodes as the empty string
        let raw = b"\x00\x01f\0octet\0tsize";
        let packet = Packet::deser(&mut raw.as_slice()).unwrap();
        match packet {
            Packet::Rrq(request) => {
                assert_eq!(request.options.get("tsize").map(String::as_str), Some(""));
            }
            other => panic!("expected RRQ, got {:?}", other),
        }
    }

    #[test]
    fn test_deser_oack() {
        let raw = b"\x00\x06blksize\x001024\0tsize\x002000\0";
        let packet = Packet::deser(&mut raw.as_slice()).unwrap();
        assert_eq!(
            packet,
            Packet::Oack {
                options: vec![
                    ("blksize".to_string(), "1024".to_string()),
                    ("tsize".to_string(), "2000".to_string()),
                ]
            }
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![0])]
    #[case::opcode_zero(vec![0, 0])]
    #[case::opcode_out_of_range(vec![0, 9])]
    #[case::rrq_unterminated_filename(vec![0,1, b'h',b'i'])]
    #[case::rrq_missing_mode(vec![0,1, b'h',b'i',0])]
    #[case::ack_without_block(vec![0,4, 0])]
    #[case::data_without_block(vec![0,3])]
    fn test_deser_rejects(#[case] raw: Vec<u8>) {
        assert!(Packet::deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_request_round_trip() {
        let mut options = FxHashMap::default();
        options.insert("blksize".to_string(), "512".to_string());
        let original = Packet::Rrq(Request {
            filename: "a/b.txt".to_string(),
            mode: "octet".to_string(),
            options,
        });
        let raw = ser(&original);
        assert_eq!(Packet::deser(&mut raw.as_slice()).unwrap(), original);
    }
}
