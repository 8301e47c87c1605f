//! Caching reverse proxy for Git LFS object transfers.
//!
//! The proxy forwards the LFS batch API to an upstream server, rewrites the
//! download URLs in its responses to point back at itself, and serves object
//! bytes out of a local disk cache. The first request for an object streams
//! it from the origin while concurrent requests for the same object tail the
//! same growing file.

/// Git LFS batch payloads and the download-action rewrite.
pub mod batch;
/// Filesystem cache with single-flight population.
pub mod cache;
/// Keyed-MAC handoff between batch rewriting and content fetching.
pub mod handoff;
/// HTTP surface: routing, content serving, upstream fetching, proxying.
pub mod server;

pub use cache::{FilesystemCache, Source};
pub use handoff::SigningKey;
pub use server::Server;

/// Path prefix for cached content delivery.
pub const CONTENT_CACHE_PATH_PREFIX: &str = "/_lfs_cache/";

/// Header listing the names of the headers to replay when fetching the
/// original content location.
pub const UPSTREAM_HEADER_LIST: &str = "X-Lfs-Cache-Header-List";

/// Header carrying the href of the original content location.
pub const ORIGINAL_HREF_HEADER: &str = "X-Lfs-Cache-Original-Href";

/// Header carrying the size of the content to be downloaded.
pub const SIZE_HEADER: &str = "X-Lfs-Cache-Size";

/// Header proving the proxy itself authored the three headers above.
pub const SIGNATURE_HEADER: &str = "X-Lfs-Signature";
