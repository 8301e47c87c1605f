//! The LFS caching proxy server.
//!
//! Three routes share one upstream:
//!
//! - `POST /objects/batch` is proxied and its download hrefs are rewritten
//!   to point back at this proxy (see [`crate::batch`]).
//! - `GET /_lfs_cache/<oid>` serves object bytes through the filesystem
//!   cache, fetching from the original href on first access while every
//!   concurrent request tails the same download.
//! - Everything else is passed through unmodified.

use std::{convert::Infallible, io::Write, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::BoxBody};
use hyper::{
    Request, Response,
    body::{Frame, Incoming},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{AnyError, Result, StdResultExt, anyerr, ensure_any, stack_error};
use n0_future::{Stream, stream, stream::StreamExt, time::Instant};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, warn, warn_span};

use crate::{
    CONTENT_CACHE_PATH_PREFIX,
    batch::{self, BatchResponse, RequestOrigin, TRANSFER_BASIC},
    cache::{CacheReader, FilesystemCache, StreamWriter},
    handoff::{FetchDirective, SigningKey},
};

mod range;

/// Response body type shared by every handler.
type Body = BoxBody<Bytes, Infallible>;

/// Buffered frames per streaming response body.
const BODY_CHANNEL_CAPACITY: usize = 4;

/// Read buffer for serving cached bytes.
const SERVE_BUFFER_SIZE: usize = 64 * 1024;

/// Error type for request handling, carrying the status to surface to the
/// client.
#[stack_error(add_meta, derive)]
pub struct ServeError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl ServeError {
    /// Returns the HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    fn internal(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::INTERNAL_SERVER_ERROR), source.into())
    }

    fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }
}

/// LFS caching reverse proxy.
pub struct Server {
    upstream: Url,
    cache: Option<Arc<FilesystemCache>>,
    client: reqwest::Client,
    key: SigningKey,
}

impl Server {
    /// Creates a caching proxy for `upstream`, storing objects under
    /// `directory`.
    pub fn new(upstream: &str, directory: impl Into<PathBuf>, key: SigningKey) -> Result<Self> {
        let mut server = Self::new_uncached(upstream, key)?;
        let cache =
            FilesystemCache::new(directory).std_context("failed to create cache layout")?;
        server.cache = Some(Arc::new(cache));
        Ok(server)
    }

    /// Creates a proxy that rewrites batches but streams content straight
    /// from the origin instead of caching it.
    pub fn new_uncached(upstream: &str, key: SigningKey) -> Result<Self> {
        let mut upstream = Url::parse(upstream).std_context("invalid upstream url")?;
        ensure_any!(
            matches!(upstream.scheme(), "http" | "https"),
            "unsupported upstream url scheme {:?}",
            upstream.scheme()
        );
        // Relative resolution in `upstream_url` must keep the base path.
        if !upstream.path().ends_with('/') {
            let path = format!("{}/", upstream.path());
            upstream.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .anyerr()?;

        Ok(Self {
            upstream,
            cache: None,
            client,
            key,
        })
    }

    /// Accepts connections on `listener` and serves them until the listener
    /// fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut conn_id = 0u64;
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            conn_id += 1;
            let server = self.clone();
            tokio::spawn(
                async move {
                    debug!("new connection from {peer_addr}");
                    let service = service_fn(move |request| {
                        let server = server.clone();
                        async move { Ok::<_, Infallible>(server.handle(request).await) }
                    });
                    if let Err(err) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!("connection closed with error: {err:#}");
                    } else {
                        debug!("connection closed");
                    }
                }
                .instrument(warn_span!("conn", id = %conn_id)),
            );
        }
    }

    async fn handle(self: Arc<Self>, request: Request<Incoming>) -> Response<Body> {
        let origin = request_origin(&request);
        let path = request.uri().path().to_owned();
        debug!(method = %request.method(), %path, "request");

        let result = if path == "/objects/batch" {
            self.batch(request, origin).await
        } else if path.starts_with(CONTENT_CACHE_PATH_PREFIX) {
            let oid = path.rsplit('/').next().unwrap_or_default().to_owned();
            self.content(request, &oid).await
        } else {
            self.proxy(request).await
        };

        result.unwrap_or_else(|err| {
            let status = err
                .response_status()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            warn!(%path, %status, "request failed: {err:#}");
            status_response(status)
        })
    }

    /// Pass-through reverse proxy for non-cache routes.
    async fn proxy(&self, request: Request<Incoming>) -> Result<Response<Body>, ServeError> {
        let response = self.forward(request).await?;
        Ok(streamed_response(response))
    }

    /// Forwards `request` to the upstream, streaming the body both ways.
    async fn forward(&self, request: Request<Incoming>) -> Result<reqwest::Response, ServeError> {
        let url = self.upstream_url(request.uri())?;
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        filter_hop_by_hop_headers(&mut headers);
        // The client library derives these from the target URL and the
        // streamed body; stale values from the incoming request would lie.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        // Keep clients that sent no User-Agent anonymous upstream.
        headers
            .entry(header::USER_AGENT)
            .or_insert(HeaderValue::from_static(""));

        self.client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(incoming_to_stream(body)))
            .send()
            .await
            .map_err(|err| ServeError::bad_gateway(anyerr!(err)))
    }

    fn upstream_url(&self, uri: &Uri) -> Result<Url, ServeError> {
        let mut relative = uri.path().trim_start_matches('/').to_owned();
        if let Some(query) = uri.query() {
            relative.push('?');
            relative.push_str(query);
        }
        self.upstream
            .join(&relative)
            .map_err(|err| ServeError::bad_request(anyerr!(err)))
    }

    /// Proxies the batch discovery call and rewrites download actions.
    async fn batch(
        &self,
        request: Request<Incoming>,
        origin: RequestOrigin,
    ) -> Result<Response<Body>, ServeError> {
        let upstream = self.forward(request).await?;
        let status = upstream.status();
        if status != StatusCode::OK {
            warn!(%status, "upstream batch endpoint responded with an error");
            return Ok(streamed_response(upstream));
        }

        let mut headers = upstream.headers().clone();
        filter_hop_by_hop_headers(&mut headers);
        let compressed = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));

        let raw = upstream
            .bytes()
            .await
            .map_err(|err| ServeError::bad_gateway(anyerr!(err)))?;
        let decoded = if compressed {
            batch::gunzip(&raw).map_err(|err| ServeError::bad_gateway(anyerr!(err)))?
        } else {
            raw.to_vec()
        };

        let mut response: BatchResponse = serde_json::from_slice(&decoded)
            .map_err(|err| ServeError::bad_gateway(anyerr!("invalid upstream batch payload: {err}")))?;

        // Other transfer adapters negotiate hrefs the proxy cannot
        // intercept, so their batches travel unmodified.
        if !response.transfer.is_empty() && response.transfer != TRANSFER_BASIC {
            debug!(transfer = %response.transfer, "passing through non-basic transfer batch");
            return Ok(sized_response(status, headers, raw.to_vec()));
        }

        batch::rewrite(&mut response, &self.key, &origin);

        let encoded = serde_json::to_vec(&response)
            .map_err(|err| ServeError::internal(anyerr!(err)))?;
        let body = if compressed {
            batch::gzip(&encoded).map_err(|err| ServeError::internal(anyerr!(err)))?
        } else {
            encoded
        };

        Ok(sized_response(status, headers, body))
    }

    /// Serves a signed content request through the cache.
    async fn content(
        self: &Arc<Self>,
        request: Request<Incoming>,
        oid: &str,
    ) -> Result<Response<Body>, ServeError> {
        let directive = FetchDirective::from_headers(&self.key, request.headers())
            .map_err(|err| ServeError::bad_request(anyerr!(err)))?;
        let size = directive.size;

        let Some(cache) = &self.cache else {
            return self.content_uncached(directive).await;
        };

        let (reader, writer, source) = cache
            .get(oid)
            .await
            .map_err(|err| ServeError::internal(anyerr!(err)))?;
        info!(%oid, %source, size, "serving");

        if let Some(writer) = writer {
            let server = self.clone();
            let cache = cache.clone();
            let oid = oid.to_owned();
            let span = warn_span!("fetch", oid = %oid);
            tokio::spawn(
                async move { server.fetch(cache, writer, oid, directive).await }.instrument(span),
            );
        }

        serve_reader(request.method(), reader, size, request.headers())
    }

    /// Streams the object straight from the origin when caching is off.
    async fn content_uncached(
        &self,
        directive: FetchDirective,
    ) -> Result<Response<Body>, ServeError> {
        let response = self
            .client
            .get(&directive.href)
            .headers(directive.headers)
            .send()
            .await
            .map_err(|err| ServeError::bad_gateway(anyerr!(err)))?;
        Ok(streamed_response(response))
    }

    /// Drives the upstream download into the cache writer.
    ///
    /// Always reports the outcome to [`FilesystemCache::done`] exactly once.
    /// A cache that can no longer promote or discard an entry is corrupt,
    /// so a failure there takes the process down.
    async fn fetch(
        self: Arc<Self>,
        cache: Arc<FilesystemCache>,
        mut writer: StreamWriter,
        oid: String,
        directive: FetchDirective,
    ) {
        info!(size = directive.size, "fetching");
        let start = Instant::now();
        let mut downloaded = 0u64;
        let outcome = self
            .fetch_into(&mut writer, &oid, &directive, &mut downloaded)
            .await;
        match &outcome {
            Ok(()) => {
                info!(downloaded, size = directive.size, elapsed = ?start.elapsed(), "fetched")
            }
            Err(err) => {
                warn!(downloaded, size = directive.size, elapsed = ?start.elapsed(), "fetch failed: {err:#}")
            }
        }

        if let Err(err) = cache.done(&oid, outcome).await {
            error!("cache left inconsistent while finishing {oid}: {err:#}");
            std::process::abort();
        }
    }

    async fn fetch_into(
        &self,
        writer: &mut StreamWriter,
        oid: &str,
        directive: &FetchDirective,
        downloaded: &mut u64,
    ) -> Result<(), AnyError> {
        let response = self
            .client
            .get(&directive.href)
            .headers(directive.headers.clone())
            .send()
            .await
            .anyerr()?;
        ensure_any!(
            response.status() == StatusCode::OK,
            "upstream server responded with {} status",
            response.status()
        );

        let mut hasher = Sha256::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.anyerr()?;
            writer.write_all(&chunk).anyerr()?;
            hasher.update(&chunk);
            *downloaded += chunk.len() as u64;
        }

        let digest = hex::encode(hasher.finalize());
        ensure_any!(digest == oid, "file checksum mismatch");
        Ok(())
    }
}

/// Captures the externally visible host before the request is proxied, so
/// batch rewriting can point hrefs back at this proxy.
fn request_origin(request: &Request<Incoming>) -> RequestOrigin {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .or_else(|| {
            request
                .uri()
                .authority()
                .map(|authority| authority.to_string())
        })
        .unwrap_or_default();
    // The only listener speaks plain HTTP; a fronting TLS terminator would
    // flip this.
    RequestOrigin { https: false, host }
}

/// Streams `reader` as a range-capable response bounded to `size` bytes.
fn serve_reader(
    method: &Method,
    reader: CacheReader,
    size: u64,
    headers: &HeaderMap,
) -> Result<Response<Body>, ServeError> {
    let range = match range::resolve(headers, size) {
        Ok(range) => range,
        Err(range::RangeUnsatisfiable) => {
            let mut response = status_response(StatusCode::RANGE_NOT_SATISFIABLE);
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(range::unsatisfied_range(size))?,
            );
            return Ok(response);
        }
    };

    let (status, start, length) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.start, range.len()),
        None => (StatusCode::OK, 0, size),
    };

    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Some(range) = range {
        response_headers.insert(header::CONTENT_RANGE, header_value(range.content_range(size))?);
    }

    if method == Method::HEAD {
        return Ok(response);
    }

    *response.body_mut() = reader_body(reader, start, length);
    Ok(response)
}

/// Pumps up to `length` bytes of `reader` starting at `start` into a body
/// channel. Dropping the response aborts the pump and releases the reader.
fn reader_body(reader: CacheReader, start: u64, length: u64) -> Body {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut buf = vec![0u8; SERVE_BUFFER_SIZE];
        let mut offset = start;
        let end = start + length;
        while offset < end {
            let want = buf.len().min((end - offset) as usize);
            match reader.read_at(&mut buf[..want], offset).await {
                Ok(0) => break,
                Ok(n) => {
                    offset += n as u64;
                    let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("cache read failed mid-stream: {err}");
                    break;
                }
            }
        }
    });
    channel_body(rx)
}

/// Converts an upstream response into a hyper response, streaming the body
/// through a frame channel.
fn streamed_response(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    filter_hop_by_hop_headers(&mut headers);

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut body = upstream.bytes_stream();
        while let Some(chunk) = body.next().await {
            let frame = match chunk {
                Ok(bytes) => Frame::data(bytes),
                Err(err) => {
                    // Terminate the body; the client sees the truncation.
                    warn!("upstream body failed mid-stream: {err:#}");
                    break;
                }
            };
            if tx.send(Ok(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut response = Response::new(channel_body(rx));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// A fully buffered response with an up-to-date `Content-Length`.
fn sized_response(status: StatusCode, mut headers: HeaderMap, body: Vec<u8>) -> Response<Body> {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// Converts a hyper request body into a byte stream for the upstream client.
fn incoming_to_stream(body: Incoming) -> impl Stream<Item = Result<Bytes, hyper::Error>> + Send {
    stream::unfold(body, async |mut body| {
        loop {
            match body.frame().await {
                None => return None,
                Some(Err(err)) => return Some((Err(err), body)),
                Some(Ok(frame)) => {
                    if let Ok(bytes) = frame.into_data() {
                        return Some((Ok(bytes), body));
                    }
                    // Trailer frames are dropped.
                }
            }
        }
    })
}

/// Strips connection-scoped headers before forwarding, per RFC 9110.
fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Names listed in a Connection header are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn channel_body(rx: mpsc::Receiver<Result<Frame<Bytes>, Infallible>>) -> Body {
    BoxBody::new(StreamBody::new(ReceiverStream::new(rx)))
}

fn empty_body() -> Body {
    BoxBody::new(Empty::new())
}

fn full_body(body: Vec<u8>) -> Body {
    BoxBody::new(Full::new(Bytes::from(body)))
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn header_value(value: String) -> Result<HeaderValue, ServeError> {
    HeaderValue::from_str(&value).map_err(|err| ServeError::internal(anyerr!(err)))
}
