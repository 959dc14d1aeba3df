use base64::prelude::*;
use rand::RngCore as _;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

/// Random base64url token carrying `len` bytes of entropy.
pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64url(&bytes)
}

/// Formats a timestamp the way protocol documents carry them.
pub(crate) fn rfc3339(ts: OffsetDateTime) -> String {
    // RFC 3339 formatting only fails for years outside 0..=9999
    ts.format(&Rfc3339).unwrap_or_default()
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes an even-length hex string of either case.
pub(crate) fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 || !input.is_ascii() {
        return None;
    }

    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        let a = random_token(16);
        let b = random_token(16);
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
    }

    #[test]
    fn formats_timestamps() {
        let ts = OffsetDateTime::from_unix_timestamp(1_546_300_800).unwrap();
        assert_eq!(rfc3339(ts), "2019-01-01T00:00:00Z");
    }

    #[test]
    fn hex_encodes_lowercase_and_decodes_either_case() {
        assert_eq!(hex(&[0x01, 0xab, 0xff]), "01abff");
        assert_eq!(hex_decode("01ABff"), Some(vec![0x01, 0xab, 0xff]));
        assert_eq!(hex_decode("0"), None);
        assert_eq!(hex_decode("zz"), None);
    }
}
