//! Best-effort WebSocket frame decoding for log lines.
//!
//! The relay hands every chunk it forwards to [`describe`] and logs the
//! result. Nothing here can affect forwarding: both functions are total and
//! only read the chunk.
//!
//! Only a single read is inspected. Frames split across reads, fragmented
//! messages and binary payloads all come back as `None`.

const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Decode `chunk` as one WebSocket frame carrying UTF-8 text.
pub fn try_decode(chunk: &[u8]) -> Option<String> {
    // Byte 0 (FIN + opcode) is not needed to find the payload.
    let (_, rest) = chunk.split_first()?;
    let (&len_byte, mut rest) = rest.split_first()?;

    let masked = len_byte & MASK_BIT != 0;
    let payload_len = match len_byte & LENGTH_MASK {
        LENGTH_16 => {
            let (ext, tail) = split_array::<2>(rest)?;
            rest = tail;
            u64::from(u16::from_be_bytes(ext))
        }
        LENGTH_64 => {
            let (ext, tail) = split_array::<8>(rest)?;
            rest = tail;
            u64::from_be_bytes(ext)
        }
        short => u64::from(short),
    };

    let key = if masked {
        let (key, tail) = split_array::<4>(rest)?;
        rest = tail;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len).ok()?;
    let payload = rest.get(..payload_len)?;

    let text = match key {
        Some(key) => payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect(),
        None => payload.to_vec(),
    };

    String::from_utf8(text).ok()
}

/// One-line annotation for a relayed chunk.
pub fn describe(chunk: &[u8]) -> String {
    match try_decode(chunk) {
        Some(text) => format!("(WS-Decoded): {}", text.trim().replace(['\r', '\n'], " ")),
        None => format!("{} bytes (Raw/Binary)", chunk.len()),
    }
}

fn split_array<const N: usize>(bytes: &[u8]) -> Option<([u8; N], &[u8])> {
    if bytes.len() < N {
        return None;
    }
    let (head, tail) = bytes.split_at(N);
    Some((head.try_into().ok()?, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn masked(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x81, MASK_BIT | payload.len() as u8];
        frame.extend_from_slice(&KEY);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ KEY[i % 4]));
        frame
    }

    #[test]
    fn test_plain_text_frame() {
        let frame = [0x81, 0x05, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(try_decode(&frame).as_deref(), Some("hello"));
    }

    #[test]
    fn test_masked_text_frame() {
        // RFC 6455 section 5.7 example
        let frame = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        assert_eq!(try_decode(&frame).as_deref(), Some("Hello"));
        assert_eq!(try_decode(&masked(b"hello")).as_deref(), Some("hello"));
    }

    #[test]
    fn test_truncated_payload() {
        let frame = [0x81, 0x0a, b'h', b'e', b'l'];
        assert_eq!(try_decode(&frame), None);
    }

    #[test]
    fn test_truncated_headers() {
        assert_eq!(try_decode(&[]), None);
        assert_eq!(try_decode(&[0x81]), None);
        // 16-bit length with one length byte
        assert_eq!(try_decode(&[0x81, 126, 0x00]), None);
        // 64-bit length with four length bytes
        assert_eq!(try_decode(&[0x81, 127, 0, 0, 0, 0]), None);
        // mask flag without a full key
        assert_eq!(try_decode(&[0x81, 0x85, 0x37, 0xfa]), None);
    }

    #[test]
    fn test_extended_16_bit_length() {
        let text = "x".repeat(300);
        let mut frame = vec![0x81, 126];
        frame.extend_from_slice(&300u16.to_be_bytes());
        frame.extend_from_slice(text.as_bytes());

        assert_eq!(try_decode(&frame), Some(text));
    }

    #[test]
    fn test_extended_64_bit_length_overflow() {
        let mut frame = vec![0x82, 127];
        frame.extend_from_slice(&u64::MAX.to_be_bytes());
        frame.extend_from_slice(b"abc");

        assert_eq!(try_decode(&frame), None);
    }

    #[test]
    fn test_binary_payload_is_not_text() {
        let frame = [0x82, 0x03, 0xff, 0xfe, 0xfd];
        assert_eq!(try_decode(&frame), None);
    }

    #[test]
    fn test_describe() {
        let frame = masked(b"  {\"cmd\":\n\"sign\"}\n");
        assert_eq!(describe(&frame), "(WS-Decoded): {\"cmd\": \"sign\"}");
        assert_eq!(describe(&[0x16, 0x03, 0x01]), "3 bytes (Raw/Binary)");
    }
}
