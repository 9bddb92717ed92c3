//! PEM framing for certificates and keys.
//!
//! Overmesh key material is stored on disk as base64 bodies between
//! type-specific banners, one object per file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{PkiError, PkiResult};

pub const BANNER_CERTIFICATE: &str = "OVERMESH CERTIFICATE";
pub const BANNER_ED25519_PRIVATE_KEY: &str = "OVERMESH ED25519 PRIVATE KEY";
pub const BANNER_X25519_PRIVATE_KEY: &str = "OVERMESH X25519 PRIVATE KEY";
pub const BANNER_PUBLIC_KEY: &str = "OVERMESH PUBLIC KEY";

const LINE_WIDTH: usize = 64;

/// Wrap raw bytes in a PEM block with the given banner
pub fn encode_pem(banner: &str, data: &[u8]) -> String {
    let body = STANDARD.encode(data);
    let mut out = String::with_capacity(body.len() + banner.len() * 2 + 40);
    out.push_str("-----BEGIN ");
    out.push_str(banner);
    out.push_str("-----\n");
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        // chunks of an ASCII string are valid UTF-8
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(banner);
    out.push_str("-----\n");
    out
}

/// Unwrap the first PEM block in `input`, requiring the given banner.
///
/// Returns the decoded bytes and the remainder of the input after the
/// block, so callers can walk files holding several certificates.
pub fn decode_pem<'a>(banner: &str, input: &'a str) -> PkiResult<(Vec<u8>, &'a str)> {
    let begin = format!("-----BEGIN {}-----", banner);
    let end = format!("-----END {}-----", banner);

    let start = input
        .find(&begin)
        .ok_or_else(|| PkiError::InvalidPem(format!("missing {} banner", banner)))?;
    let body_start = start + begin.len();
    let body_end = input[body_start..]
        .find(&end)
        .map(|i| body_start + i)
        .ok_or_else(|| PkiError::InvalidPem(format!("missing {} end banner", banner)))?;

    let body: String = input[body_start..body_end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let data = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| PkiError::InvalidPem(e.to_string()))?;

    let rest = &input[body_end + end.len()..];
    Ok((data, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_roundtrip() {
        let data = vec![0u8, 1, 2, 3, 250, 251, 252];
        let pem = encode_pem(BANNER_CERTIFICATE, &data);
        assert!(pem.starts_with("-----BEGIN OVERMESH CERTIFICATE-----"));

        let (decoded, rest) = decode_pem(BANNER_CERTIFICATE, &pem).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(rest.trim(), "");
    }

    #[test]
    fn test_pem_multiple_blocks() {
        let a = encode_pem(BANNER_CERTIFICATE, b"first");
        let b = encode_pem(BANNER_CERTIFICATE, b"second");
        let joined = format!("{}{}", a, b);

        let (first, rest) = decode_pem(BANNER_CERTIFICATE, &joined).unwrap();
        assert_eq!(first, b"first");
        let (second, _) = decode_pem(BANNER_CERTIFICATE, rest).unwrap();
        assert_eq!(second, b"second");
    }

    #[test]
    fn test_pem_wrong_banner() {
        let pem = encode_pem(BANNER_PUBLIC_KEY, b"key");
        assert!(decode_pem(BANNER_CERTIFICATE, &pem).is_err());
    }

    #[test]
    fn test_pem_long_body_wraps() {
        let data = vec![0xAB; 200];
        let pem = encode_pem(BANNER_PUBLIC_KEY, &data);
        for line in pem.lines() {
            assert!(line.len() <= 64 + 16);
        }
        let (decoded, _) = decode_pem(BANNER_PUBLIC_KEY, &pem).unwrap();
        assert_eq!(decoded, data);
    }
}
