//! Base64 helpers for the `data_b64` wire field (spec §6.1) and the
//! recording format's byte fields (spec §6.4).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode(input: &str) -> Option<Vec<u8>> {
    STANDARD.decode(input).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        for input in [&b""[..], b"a", b"hi", b"hi\n", b"hello world", &[0u8, 1, 2, 255, 254]] {
            let encoded = encode(input);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, input);
        }
    }

    #[test]
    fn matches_known_vectors() {
        assert_eq!(encode(b"hi\n"), "aGkK");
        assert_eq!(decode("aGkK").unwrap(), b"hi\n");
        assert_eq!(encode(b"a"), "YQ==");
        assert_eq!(decode("YQ==").unwrap(), b"a");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(decode("not valid base64!!").is_none());
    }
}
