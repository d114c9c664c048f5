//! RFC 6455 frame codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                 Masking key (if MASK set)                     |
//! +---------------------------------------------------------------+
//! |                        Payload data                           |
//! +---------------------------------------------------------------+
//! ```

use std::fmt;

use crate::error::ProtocolError;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: [u8; 3] = [0x40, 0x20, 0x10];
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;
const HIGH_BIT_64: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any of the reserved values 3-7 and 11-15.
    Reserved(u8),
}

impl OpCode {
    /// Maps the low nibble of `value`; every 4-bit value has a variant.
    pub fn from_u8(value: u8) -> Self {
        match value & OPCODE_MASK {
            0 => OpCode::Continuation,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::Reserved(value) => value & OPCODE_MASK,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Continuation => write!(f, "continuation"),
            OpCode::Text => write!(f, "text"),
            OpCode::Binary => write!(f, "binary"),
            OpCode::Close => write!(f, "close"),
            OpCode::Ping => write!(f, "ping"),
            OpCode::Pong => write!(f, "pong"),
            OpCode::Reserved(value) => write!(f, "reserved({})", value),
        }
    }
}

/// Header settings for [`Frame::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub opcode: OpCode,
    pub reserved: [bool; 3],
    pub fin: bool,
}

impl EncodeOptions {
    pub fn binary() -> Self {
        Self {
            opcode: OpCode::Binary,
            ..Self::default()
        }
    }

    pub fn with_opcode(opcode: OpCode) -> Self {
        Self {
            opcode,
            ..Self::default()
        }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            opcode: OpCode::Text,
            reserved: [false; 3],
            fin: true,
        }
    }
}

/// One decoded frame. `payload` is always unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub reserved: [bool; 3],
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_length: u64,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
    pub close_code: Option<u16>,
    pub close_reason: Option<Vec<u8>>,
}

impl Frame {
    /// Decodes exactly one frame from the start of `bytes`.
    ///
    /// Bytes past the end of the frame are ignored. Input shorter than the
    /// frame it announces fails with [`ProtocolError::Incomplete`].
    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::Empty);
        }
        match Self::parse(bytes)? {
            Some((frame, _)) => Ok(frame),
            None => Err(ProtocolError::Incomplete {
                needed: Self::missing_bytes(bytes),
            }),
        }
    }

    /// Streaming decode: `Ok(None)` while `buf` holds less than one frame,
    /// otherwise the frame and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        let Some(header) = Header::read(buf)? else {
            return Ok(None);
        };

        let total = header.total_len()?;
        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = buf[header.payload_offset..total].to_vec();
        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, key);
        }

        let (close_code, close_reason) = if header.opcode == OpCode::Close {
            split_close_payload(&payload)
        } else {
            (None, None)
        };

        let frame = Frame {
            fin: header.fin,
            reserved: header.reserved,
            opcode: header.opcode,
            masked: header.mask_key.is_some(),
            payload_length: header.payload_length,
            mask_key: header.mask_key,
            payload,
            close_code,
            close_reason,
        };
        Ok(Some((frame, total)))
    }

    /// Reads only the header at the start of `buf`. `Ok(None)` until the
    /// whole header has arrived; the payload is neither copied nor unmasked.
    pub fn peek(buf: &[u8]) -> Result<Option<FrameSize>, ProtocolError> {
        let Some(header) = Header::read(buf)? else {
            return Ok(None);
        };
        Ok(Some(FrameSize {
            payload_length: header.payload_length,
            total: header.total_len()?,
        }))
    }

    /// Serialises `payload` into an unmasked frame.
    pub fn encode(payload: &[u8], options: &EncodeOptions) -> Vec<u8> {
        let mut first = options.opcode.as_u8();
        if options.fin {
            first |= FIN_BIT;
        }
        for (set, bit) in options.reserved.iter().zip(RSV_BITS) {
            if *set {
                first |= bit;
            }
        }

        let length = payload.len();
        let mut out = Vec::with_capacity(length + 10);
        out.push(first);
        if length < LENGTH_16 as usize {
            out.push(length as u8);
        } else if length <= u16::MAX as usize {
            out.push(LENGTH_16);
            out.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            out.push(LENGTH_64);
            out.extend_from_slice(&(length as u64).to_be_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    /// Builds a complete close frame carrying `code` and `reason`.
    pub fn close(code: u16, reason: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        Self::encode(&payload, &EncodeOptions::with_opcode(OpCode::Close))
    }

    pub fn is_close(&self) -> bool {
        self.opcode == OpCode::Close
    }

    /// Payload as text when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn close_reason_text(&self) -> String {
        self.close_reason
            .as_deref()
            .map(|reason| String::from_utf8_lossy(reason).into_owned())
            .unwrap_or_default()
    }

    fn missing_bytes(buf: &[u8]) -> usize {
        match Header::read(buf) {
            Ok(Some(header)) => header
                .total_len()
                .unwrap_or(usize::MAX)
                .saturating_sub(buf.len()),
            _ => Header::required_len(buf).saturating_sub(buf.len()),
        }
    }
}

/// Sizes announced by a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub payload_length: u64,
    /// Header plus payload, in bytes.
    pub total: usize,
}

struct Header {
    fin: bool,
    reserved: [bool; 3],
    opcode: OpCode,
    payload_length: u64,
    mask_key: Option<[u8; 4]>,
    payload_offset: usize,
}

impl Header {
    fn read(buf: &[u8]) -> Result<Option<Header>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let needed = Self::required_len(buf);
        if buf.len() < needed {
            return Ok(None);
        }

        let first = buf[0];
        let second = buf[1];
        let masked = second & MASK_BIT != 0;

        let (payload_length, key_offset) = match second & LENGTH_MASK {
            LENGTH_16 => (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4),
            LENGTH_64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let length = u64::from_be_bytes(raw);
                // the most significant bit must be 0
                if length & HIGH_BIT_64 != 0 {
                    return Err(ProtocolError::FrameTooLarge { size: length });
                }
                (length, 10)
            }
            short => (short as u64, 2),
        };

        let (mask_key, payload_offset) = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[key_offset..key_offset + 4]);
            (Some(key), key_offset + 4)
        } else {
            (None, key_offset)
        };

        Ok(Some(Header {
            fin: first & FIN_BIT != 0,
            reserved: RSV_BITS.map(|bit| first & bit != 0),
            opcode: OpCode::from_u8(first),
            payload_length,
            mask_key,
            payload_offset,
        }))
    }

    fn total_len(&self) -> Result<usize, ProtocolError> {
        (self.payload_offset as u64)
            .checked_add(self.payload_length)
            .and_then(|total| usize::try_from(total).ok())
            .ok_or(ProtocolError::FrameTooLarge {
                size: self.payload_length,
            })
    }

    /// Header size announced by the first two bytes (2 when fewer are present).
    fn required_len(buf: &[u8]) -> usize {
        let Some(&second) = buf.get(1) else {
            return 2;
        };
        let base = match second & LENGTH_MASK {
            LENGTH_16 => 4,
            LENGTH_64 => 10,
            _ => 2,
        };
        if second & MASK_BIT != 0 {
            base + 4
        } else {
            base
        }
    }
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn split_close_payload(payload: &[u8]) -> (Option<u16>, Option<Vec<u8>>) {
    if payload.len() < 2 {
        return (None, Some(Vec::new()));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (Some(code), Some(payload[2..].to_vec()))
}

/// Masks `payload` the way a client would. Used by tests and client-side writers.
pub fn mask_payload(payload: &[u8], options: &EncodeOptions, key: [u8; 4]) -> Vec<u8> {
    let mut frame = Frame::encode(payload, options);
    let header_len = frame.len() - payload.len();
    frame[1] |= MASK_BIT;
    let mut body = frame.split_off(header_len);
    apply_mask(&mut body, key);
    frame.extend_from_slice(&key);
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_decode_rfc_masked_hello() {
        // RFC 6455 section 5.7, single-frame masked text message
        let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = Frame::decode(&bytes).unwrap();

        assert!(frame.fin);
        assert_eq!(frame.reserved, [false; 3]);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.masked);
        assert_eq!(frame.mask_key, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.payload_length, 5);
        assert_eq!(frame.payload, b"Hello");
        assert_eq!(frame.text(), Some("Hello"));
        assert_eq!(frame.close_code, None);
        assert_eq!(frame.close_reason, None);
    }

    #[test]
    fn test_round_trip_preserves_header_bits() {
        let options = EncodeOptions {
            opcode: OpCode::Binary,
            reserved: [true, false, true],
            fin: false,
        };
        let payload = [0u8, 1, 2, 255, 128];
        let frame = Frame::decode(&Frame::encode(&payload, &options)).unwrap();

        assert_eq!(frame.payload, payload);
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.reserved, [true, false, true]);
        assert!(!frame.fin);
        assert!(!frame.masked);
        assert_eq!(frame.mask_key, None);
    }

    #[test]
    fn test_length_tiers() {
        let cases: [(usize, usize, u8); 5] = [
            (0, 2, 0),
            (125, 2, 125),
            (126, 4, LENGTH_16),
            (65535, 4, LENGTH_16),
            (65536, 10, LENGTH_64),
        ];

        for (length, header_len, marker) in cases {
            let payload = vec![b'x'; length];
            let encoded = Frame::encode(&payload, &EncodeOptions::default());

            assert_eq!(encoded.len(), header_len + length, "length {}", length);
            assert_eq!(encoded[1], marker, "length {}", length);

            let frame = Frame::decode(&encoded).unwrap();
            assert_eq!(frame.payload_length, length as u64);
            assert_eq!(frame.payload.len(), length);
        }
    }

    #[test]
    fn test_extended_length_is_big_endian() {
        let encoded = Frame::encode(&vec![0u8; 300], &EncodeOptions::default());
        assert_eq!(&encoded[..4], &[0x81, 126, 0x01, 0x2c]);

        let encoded = Frame::encode(&vec![0u8; 65536], &EncodeOptions::binary());
        assert_eq!(&encoded[..10], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_masked_extended_length() {
        let payload = vec![b'a'; 200];
        let key = [1, 2, 3, 4];
        let masked = mask_payload(&payload, &EncodeOptions::default(), key);

        assert_eq!(masked[1], MASK_BIT | LENGTH_16);
        assert_eq!(&masked[4..8], &key);

        let frame = Frame::decode(&masked).unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.mask_key, Some(key));
    }

    #[test]
    fn test_close_frame() {
        let frame = Frame::decode(&Frame::close(1000, b"bye")).unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(frame.is_close());
        assert_eq!(frame.close_code, Some(1000));
        assert_eq!(frame.close_reason.as_deref(), Some(&b"bye"[..]));
        assert_eq!(frame.close_reason_text(), "bye");
    }

    #[test]
    fn test_masked_close_frame() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"going away");
        let masked = mask_payload(&payload, &EncodeOptions::with_opcode(OpCode::Close), [9, 8, 7, 6]);

        let frame = Frame::decode(&masked).unwrap();
        assert_eq!(frame.close_code, Some(1001));
        assert_eq!(frame.close_reason_text(), "going away");
    }

    #[test]
    fn test_close_without_code() {
        let frame = Frame::decode(&[0x88, 0x00]).unwrap();
        assert!(frame.is_close());
        assert_eq!(frame.close_code, None);
        assert_eq!(frame.close_reason, Some(Vec::new()));
    }

    #[test]
    fn test_truncated_input() {
        let encoded = Frame::encode(b"hello world", &EncodeOptions::default());
        let err = Frame::decode(&encoded[..5]).unwrap_err();
        assert_eq!(err, ProtocolError::Incomplete { needed: 8 });

        assert_eq!(
            Frame::decode(&[0x81]).unwrap_err(),
            ProtocolError::Incomplete { needed: 1 }
        );
        assert_eq!(Frame::parse(&encoded[..5]).unwrap(), None);
    }

    #[test]
    fn test_parse_reports_consumed_bytes() {
        let mut buf = Frame::encode(b"one", &EncodeOptions::default());
        buf.extend(Frame::encode(b"two", &EncodeOptions::default()));

        let (first, used) = Frame::parse(&buf).unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(used, 5);

        let (second, used) = Frame::parse(&buf[used..]).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        assert_eq!(used, 5);
    }

    #[test]
    fn test_length_with_high_bit_rejected() {
        let bytes = [0x81, 127, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(
            Frame::decode(&bytes),
            Err(ProtocolError::FrameTooLarge { size: u64::MAX })
        );
        assert_eq!(
            Frame::peek(&bytes),
            Err(ProtocolError::FrameTooLarge { size: u64::MAX })
        );

        let mut masked = vec![0x82, 0x80 | 127, 0x80, 0, 0, 0, 0, 0, 0, 0];
        masked.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            Frame::parse(&masked),
            Err(ProtocolError::FrameTooLarge { size: 1 << 63 })
        );
    }

    #[test]
    fn test_peek_reads_header_only() {
        let frame = mask_payload(&[b'x'; 300], &EncodeOptions::binary(), [9, 8, 7, 6]);
        let header = &frame[..8];

        assert_eq!(Frame::peek(&frame[..3]).unwrap(), None);
        assert_eq!(
            Frame::peek(header).unwrap(),
            Some(FrameSize {
                payload_length: 300,
                total: 308
            })
        );
        assert_eq!(Frame::parse(header).unwrap(), None);
    }

    #[test]
    fn test_opcode_mapping() {
        for value in 0..16u8 {
            assert_eq!(OpCode::from_u8(value).as_u8(), value);
        }
        assert_eq!(OpCode::from_u8(3), OpCode::Reserved(3));
        assert_eq!(OpCode::Close.to_string(), "close");
    }
}
