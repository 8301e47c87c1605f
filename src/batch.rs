//! Git LFS batch API payloads and the download rewrite.
//!
//! Only the fields the rewrite touches are modeled; everything else a batch
//! response carries rides along untouched through a decode/encode cycle.
//!
//! <https://github.com/git-lfs/git-lfs/blob/master/docs/api/batch.md>

use std::{
    collections::HashMap,
    io::{self, Read, Write},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    CONTENT_CACHE_PATH_PREFIX, ORIGINAL_HREF_HEADER, SIGNATURE_HEADER, SIZE_HEADER,
    UPSTREAM_HEADER_LIST, handoff::SigningKey,
};

/// The transfer adapter every client supports and the only one whose hrefs
/// the proxy intercepts.
pub const TRANSFER_BASIC: &str = "basic";

/// Operation name of the actions the rewrite points back at the proxy.
const OPERATION_DOWNLOAD: &str = "download";

/// Batch response payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transfer: String,
    pub objects: Vec<BatchObject>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One object entry of a [`BatchResponse`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchObject {
    #[serde(default)]
    pub oid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub actions: HashMap<String, BatchAction>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A transfer action (`download`, `upload`, `verify`, ...).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchAction {
    #[serde(default)]
    pub href: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Externally visible origin of the client request, captured before the
/// request is proxied so rewritten hrefs point back at this proxy.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    /// Whether the client reached the proxy over TLS.
    pub https: bool,
    /// Host (and optional port) the client addressed.
    pub host: String,
}

impl RequestOrigin {
    fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }
}

/// Points every download action back at this proxy and attaches the signed
/// handoff headers the later content request presents.
pub fn rewrite(response: &mut BatchResponse, key: &SigningKey, origin: &RequestOrigin) {
    for object in &mut response.objects {
        for (operation, action) in &mut object.actions {
            if operation != OPERATION_DOWNLOAD {
                continue;
            }

            let mut names: Vec<&str> = action.header.keys().map(String::as_str).collect();
            names.sort_unstable();
            let list = names.join(";");

            let size = object.size.to_string();
            let signature = key.sign(&list, &action.href, &size);

            let href = format!(
                "{}://{}{}{}",
                origin.scheme(),
                origin.host,
                CONTENT_CACHE_PATH_PREFIX,
                object.oid
            );
            let original = std::mem::replace(&mut action.href, href);

            action.header.insert(UPSTREAM_HEADER_LIST.to_owned(), list);
            action.header.insert(ORIGINAL_HREF_HEADER.to_owned(), original);
            action.header.insert(SIZE_HEADER.to_owned(), size);
            action.header.insert(SIGNATURE_HEADER.to_owned(), signature);
        }
    }
}

/// Decompresses a gzip-encoded batch body.
pub fn gunzip(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Compresses a rewritten batch body the way the origin delivered it.
pub fn gzip(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response() -> BatchResponse {
        serde_json::from_value(json!({
            "transfer": "basic",
            "objects": [
                {
                    "oid": "foobar",
                    "size": 123,
                    "authenticated": true,
                    "actions": {
                        "download": {
                            "href": "https://origin/media/foobar",
                            "header": {"Authorization": "secret"},
                            "expires_in": 3600
                        },
                        "upload": {
                            "href": "https://origin/upload/foobar"
                        }
                    }
                },
                {
                    "oid": "missing",
                    "size": 1,
                    "error": {"code": 404, "message": "not found"}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn rewrite_points_downloads_at_the_proxy() {
        let key = SigningKey::generate();
        let origin = RequestOrigin {
            https: false,
            host: "proxy.example:8080".to_owned(),
        };

        let mut response = response();
        rewrite(&mut response, &key, &origin);

        let action = &response.objects[0].actions[OPERATION_DOWNLOAD];
        assert_eq!(
            action.href,
            format!("http://proxy.example:8080{CONTENT_CACHE_PATH_PREFIX}foobar")
        );
        assert_eq!(action.header[UPSTREAM_HEADER_LIST], "Authorization");
        assert_eq!(action.header[ORIGINAL_HREF_HEADER], "https://origin/media/foobar");
        assert_eq!(action.header[SIZE_HEADER], "123");
        key.verify(
            "Authorization",
            "https://origin/media/foobar",
            "123",
            &action.header[SIGNATURE_HEADER],
        )
        .unwrap();

        // Authorization still travels to the client untouched.
        assert_eq!(action.header["Authorization"], "secret");
    }

    #[test]
    fn non_download_actions_are_untouched() {
        let key = SigningKey::generate();
        let origin = RequestOrigin {
            https: false,
            host: "proxy.example".to_owned(),
        };

        let mut response = response();
        rewrite(&mut response, &key, &origin);

        let upload = &response.objects[0].actions["upload"];
        assert_eq!(upload.href, "https://origin/upload/foobar");
        assert!(upload.header.is_empty());
    }

    #[test]
    fn unknown_fields_survive_the_round_trip() {
        let key = SigningKey::generate();
        let origin = RequestOrigin {
            https: true,
            host: "proxy.example".to_owned(),
        };

        let mut response = response();
        rewrite(&mut response, &key, &origin);

        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["objects"][0]["authenticated"], json!(true));
        assert_eq!(
            encoded["objects"][0]["actions"]["download"]["expires_in"],
            json!(3600)
        );
        assert_eq!(encoded["objects"][1]["error"]["code"], json!(404));
        assert!(
            encoded["objects"][0]["actions"]["download"]["href"]
                .as_str()
                .unwrap()
                .starts_with("https://proxy.example/")
        );
    }

    #[test]
    fn gzip_round_trip() {
        let body = br#"{"objects":[]}"#;
        let compressed = gzip(body).unwrap();
        assert_ne!(compressed.as_slice(), body.as_slice());
        assert_eq!(gunzip(&compressed).unwrap(), body);
    }
}
