//! Single-range `Range` header support for content serving.

use http::HeaderMap;

/// Inclusive byte range resolved against a known object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes the range covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }
}

/// The requested range lies entirely outside the object.
#[derive(Debug, PartialEq, Eq)]
pub struct RangeUnsatisfiable;

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{size}")
}

/// Resolves a request's `Range` header against `size`.
///
/// Returns `Ok(None)` when the whole object should be served: no header, a
/// malformed header (ignored per RFC 9110), or a multi-range request (served
/// whole rather than as a multipart body).
pub fn resolve(headers: &HeaderMap, size: u64) -> Result<Option<ByteRange>, RangeUnsatisfiable> {
    let Some(value) = headers
        .get(http::header::RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };

    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            // suffix form: the last `suffix` bytes
            let Ok(suffix) = suffix.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(RangeUnsatisfiable);
            }
            (size.saturating_sub(suffix), size - 1)
        }
        (start, "") => {
            let Ok(start) = start.parse::<u64>() else {
                return Ok(None);
            };
            if start >= size {
                return Err(RangeUnsatisfiable);
            }
            (start, size - 1)
        }
        (start, end) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return Ok(None);
            };
            if start > end {
                return Ok(None);
            }
            if start >= size {
                return Err(RangeUnsatisfiable);
            }
            (start, end.min(size - 1))
        }
    };

    Ok(Some(ByteRange { start, end }))
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, header::RANGE};

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn no_header_serves_whole_object() {
        assert_eq!(resolve(&HeaderMap::new(), 100), Ok(None));
    }

    #[test]
    fn bounded_range() {
        assert_eq!(
            resolve(&headers("bytes=2-5"), 100),
            Ok(Some(ByteRange { start: 2, end: 5 }))
        );
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(
            resolve(&headers("bytes=90-"), 100),
            Ok(Some(ByteRange { start: 90, end: 99 }))
        );
    }

    #[test]
    fn suffix_range() {
        assert_eq!(
            resolve(&headers("bytes=-10"), 100),
            Ok(Some(ByteRange { start: 90, end: 99 }))
        );
        // longer than the object: the whole thing
        assert_eq!(
            resolve(&headers("bytes=-500"), 100),
            Ok(Some(ByteRange { start: 0, end: 99 }))
        );
    }

    #[test]
    fn end_is_clamped_to_size() {
        assert_eq!(
            resolve(&headers("bytes=50-1000"), 100),
            Ok(Some(ByteRange { start: 50, end: 99 }))
        );
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        assert_eq!(resolve(&headers("bytes=100-"), 100), Err(RangeUnsatisfiable));
        assert_eq!(resolve(&headers("bytes=200-300"), 100), Err(RangeUnsatisfiable));
        assert_eq!(resolve(&headers("bytes=0-1"), 0), Err(RangeUnsatisfiable));
    }

    #[test]
    fn malformed_headers_are_ignored() {
        for value in ["bits=0-1", "bytes=a-b", "bytes=5", "bytes=5-2"] {
            assert_eq!(resolve(&headers(value), 100), Ok(None), "{value}");
        }
    }

    #[test]
    fn multi_range_is_served_whole() {
        assert_eq!(resolve(&headers("bytes=0-1,5-6"), 100), Ok(None));
    }

    #[test]
    fn content_range_values() {
        let range = ByteRange { start: 2, end: 5 };
        assert_eq!(range.len(), 4);
        assert_eq!(range.content_range(100), "bytes 2-5/100");
        assert_eq!(unsatisfied_range(100), "bytes */100");
    }
}
