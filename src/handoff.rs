//! Signed handoff between batch rewriting and content fetching.
//!
//! Batch rewriting knows the original upstream href, the object size and
//! which headers the origin wants echoed back. All three travel to the later
//! content request as plain HTTP headers, bound together by a keyed MAC so
//! the client can carry them without being able to point the proxy at a
//! target of its own choosing.

use std::{io, num::ParseIntError, path::Path};

use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderName};
use n0_error::stack_error;
use rand::Rng;
use sha2::Sha256;

use crate::{ORIGINAL_HREF_HEADER, SIGNATURE_HEADER, SIZE_HEADER, UPSTREAM_HEADER_LIST};

type HmacSha256 = Hmac<Sha256>;

/// Rejections while validating handoff headers.
#[stack_error(derive, from_sources)]
#[non_exhaustive]
pub enum HandoffError {
    /// The signature does not cover the presented header values.
    #[error("invalid signature")]
    InvalidSignature,
    /// The signature header is not valid hex.
    #[error("signature is not hex encoded")]
    SignatureEncoding(#[error(source, std_err)] hex::FromHexError),
    /// The size header is not a decimal byte count.
    #[error("size header is not a decimal byte count")]
    InvalidSize(#[error(source, std_err)] ParseIntError),
}

/// Process-wide signing key.
///
/// Proxy instances configured with the same key accept each other's
/// rewritten hrefs, so a fleet can sit behind one load balancer.
#[derive(Clone)]
pub struct SigningKey([u8; 64]);

impl SigningKey {
    /// Raw key length in bytes.
    pub const LEN: usize = 64;

    /// Wraps raw key bytes.
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Generates a random per-process key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Loads exactly [`LEN`](Self::LEN) raw bytes from `path`.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let bytes: [u8; Self::LEN] = bytes.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "signing key file must hold exactly 64 raw bytes",
            )
        })?;
        Ok(Self(bytes))
    }

    fn mac(&self, header_list: &str, href: &str, size: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(header_list.as_bytes());
        mac.update(href.as_bytes());
        mac.update(size.as_bytes());
        mac
    }

    /// Hex signature over the concatenation of the three header values, in
    /// order, with no separator.
    pub fn sign(&self, header_list: &str, href: &str, size: &str) -> String {
        hex::encode(self.mac(header_list, href, size).finalize().into_bytes())
    }

    /// Constant-time verification of a hex signature.
    pub fn verify(
        &self,
        header_list: &str,
        href: &str,
        size: &str,
        signature: &str,
    ) -> Result<(), HandoffError> {
        let signature = hex::decode(signature)?;
        self.mac(header_list, href, size)
            .verify_slice(&signature)
            .map_err(|_| HandoffError::InvalidSignature)
    }
}

/// Everything the proxy needs to fetch one object upstream, re-derived from
/// the handoff headers of a content request.
#[derive(Debug)]
pub struct FetchDirective {
    /// Original upstream href.
    pub href: String,
    /// Declared object size in bytes.
    pub size: u64,
    /// Headers to replay upstream, rebuilt from the signed name list.
    pub headers: HeaderMap,
}

impl FetchDirective {
    /// Verifies the signature and reconstructs the directive.
    ///
    /// Absent headers verify as empty strings, so deleting any of the three
    /// signed values fails verification just like altering one.
    pub fn from_headers(key: &SigningKey, headers: &HeaderMap) -> Result<Self, HandoffError> {
        let list = header_str(headers, UPSTREAM_HEADER_LIST);
        let href = header_str(headers, ORIGINAL_HREF_HEADER);
        let size = header_str(headers, SIZE_HEADER);
        key.verify(list, href, size, header_str(headers, SIGNATURE_HEADER))?;

        let mut upstream = HeaderMap::new();
        for name in list.split(';').filter(|name| !name.is_empty()) {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if let Some(value) = headers.get(&name) {
                upstream.append(name, value.clone());
            }
        }

        Ok(Self {
            href: href.to_owned(),
            size: size.parse()?,
            headers: upstream,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use http::HeaderValue;

    use super::*;

    fn request_headers(key: &SigningKey, list: &str, href: &str, size: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(UPSTREAM_HEADER_LIST, HeaderValue::from_str(list).unwrap());
        headers.insert(ORIGINAL_HREF_HEADER, HeaderValue::from_str(href).unwrap());
        headers.insert(SIZE_HEADER, HeaderValue::from_str(size).unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&key.sign(list, href, size)).unwrap(),
        );
        headers
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = SigningKey::generate();
        let signature = key.sign("Authorization", "https://origin/object", "123");
        key.verify("Authorization", "https://origin/object", "123", &signature)
            .unwrap();
    }

    #[test]
    fn tampered_values_are_rejected() {
        let key = SigningKey::generate();
        let signature = key.sign("Authorization", "https://origin/object", "123");

        for (list, href, size) in [
            ("Authorization;Cookie", "https://origin/object", "123"),
            ("Authorization", "https://evil/object", "123"),
            ("Authorization", "https://origin/object", "124"),
        ] {
            assert!(matches!(
                key.verify(list, href, size, &signature),
                Err(HandoffError::InvalidSignature)
            ));
        }

        assert!(matches!(
            key.verify("Authorization", "https://origin/object", "123", "zz"),
            Err(HandoffError::SignatureEncoding(_))
        ));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let ours = SigningKey::generate();
        let theirs = SigningKey::generate();
        let signature = theirs.sign("", "https://origin/object", "1");
        assert!(ours.verify("", "https://origin/object", "1", &signature).is_err());
    }

    #[test]
    fn directive_reconstructs_signed_headers() {
        let key = SigningKey::generate();
        let mut headers = request_headers(&key, "Authorization", "https://origin/object", "123");
        headers.insert("Authorization", HeaderValue::from_static("secret"));
        headers.insert("Cookie", HeaderValue::from_static("not-listed"));

        let directive = FetchDirective::from_headers(&key, &headers).unwrap();
        assert_eq!(directive.href, "https://origin/object");
        assert_eq!(directive.size, 123);
        assert_eq!(
            directive.headers.get("Authorization").unwrap(),
            HeaderValue::from_static("secret")
        );
        assert!(directive.headers.get("Cookie").is_none());
    }

    #[test]
    fn empty_header_list_verifies() {
        let key = SigningKey::generate();
        let headers = request_headers(&key, "", "https://origin/object", "0");
        let directive = FetchDirective::from_headers(&key, &headers).unwrap();
        assert!(directive.headers.is_empty());
        assert_eq!(directive.size, 0);
    }

    #[test]
    fn missing_signature_is_rejected() {
        let key = SigningKey::generate();
        let mut headers = request_headers(&key, "", "https://origin/object", "1");
        headers.remove(SIGNATURE_HEADER);
        assert!(FetchDirective::from_headers(&key, &headers).is_err());
    }

    #[test]
    fn unparseable_size_is_rejected() {
        let key = SigningKey::generate();
        let headers = request_headers(&key, "", "https://origin/object", "12x");
        assert!(matches!(
            FetchDirective::from_headers(&key, &headers),
            Err(HandoffError::InvalidSize(_))
        ));
    }

    #[test]
    fn key_file_must_hold_64_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 64]).unwrap();
        let key = SigningKey::from_file(file.path()).unwrap();
        assert_eq!(key.sign("", "", ""), SigningKey::new([7u8; 64]).sign("", "", ""));

        let mut short = tempfile::NamedTempFile::new().unwrap();
        short.write_all(&[7u8; 16]).unwrap();
        assert!(SigningKey::from_file(short.path()).is_err());
    }
}
