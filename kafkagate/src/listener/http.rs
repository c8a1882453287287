// kafkagate/src/listener/http.rs
//
// HTTP/HTTPS listener.
//
// One accept loop per listener, one task per connection, hyper serving
// HTTP/1.1 with keep-alive. POST bodies are dispatched chunk by chunk into a
// per-request decoder session, so a record never requires the whole body in
// memory; GET goes to the validator endpoint. Optional layers: TLS (with
// client-CA verification), htpasswd basic auth, deflate/gzip request bodies,
// connection/per-ip limits and an idle timeout.

use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::header;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::auth::{parse_basic_authorization, Htpasswd};
use crate::config::ListenerConfig;
use crate::decode::{validate_url, RequestVars};
use crate::error::DecoderError;
use crate::tls;

const WWW_AUTHENTICATE_BASIC: &str = "Basic realm=\"kafkagate\"";
const ALLOWED_METHODS: &str = "GET, POST";

struct Shared {
    app:      Arc<App>,
    cfg:      ListenerConfig,
    htpasswd: Option<Htpasswd>,
    /// Global connection cap, when configured.
    permits:  Option<Arc<Semaphore>>,
    /// Live connection count per client address.
    per_ip:   Arc<DashMap<IpAddr, usize>>,
}

/// Bind the port, load TLS/auth material and start the accept loop.
pub async fn spawn(
    app: Arc<App>,
    cfg: ListenerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;

    let acceptor = if cfg.http.tls_enabled() {
        Some(TlsAcceptor::from(tls::server_config(&cfg.http)?))
    } else {
        None
    };

    let htpasswd = match &cfg.http.htpasswd_file {
        Some(path) => Some(Htpasswd::load(path)?),
        None => None,
    };

    let permits = cfg
        .http
        .connection_limit
        .map(|n| Arc::new(Semaphore::new(n)));

    info!(
        "http{} listener on port {}, decoder {}",
        if acceptor.is_some() { "s" } else { "" },
        cfg.port,
        cfg.decoder.name()
    );

    let shared = Arc::new(Shared {
        app,
        cfg,
        htpasswd,
        permits,
        per_ip: Arc::new(DashMap::new()),
    });

    Ok(tokio::spawn(accept_loop(listener, acceptor, shared, cancel)))
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!("accept failed on port {}: {err}", shared.cfg.port);
                continue;
            }
        };

        let Some(permit) = acquire_connection(&shared, peer.ip()) else {
            continue; // over a connection limit, refuse silently
        };

        let shared = shared.clone();
        let acceptor = acceptor.clone();
        let conn_cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(shared, acceptor, stream, peer, conn_cancel).await;
        });
    }
    debug!("http accept loop on port {} stopped", shared.cfg.port);
}

/// Both limits taken together; released when the guard drops.
struct ConnectionPermit {
    _global: Option<tokio::sync::OwnedSemaphorePermit>,
    per_ip:  Arc<DashMap<IpAddr, usize>>,
    ip:      IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.per_ip.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                drop(count);
                self.per_ip.remove_if(&self.ip, |_, v| *v == 0);
            }
        }
    }
}

fn acquire_connection(shared: &Arc<Shared>, ip: IpAddr) -> Option<ConnectionPermit> {
    let global = match &shared.permits {
        Some(semaphore) => match semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                if shared.app.throttle.should_log("http-conn-limit") {
                    warn!("connection limit reached on port {}", shared.cfg.port);
                }
                return None;
            }
        },
        None => None,
    };

    if let Some(limit) = shared.cfg.http.per_ip_connection_limit {
        let mut count = shared.per_ip.entry(ip).or_insert(0);
        if *count >= limit {
            if shared.app.throttle.should_log(&format!("http-ip-limit:{ip}")) {
                warn!("per-ip connection limit reached for {ip}");
            }
            return None;
        }
        *count += 1;
    } else {
        *shared.per_ip.entry(ip).or_insert(0) += 1;
    }

    Some(ConnectionPermit {
        _global: global,
        per_ip: shared.per_ip.clone(),
        ip,
    })
}

async fn handle_connection(
    shared: Arc<Shared>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    match acceptor {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(
                shared.cfg.http.connection_timeout,
                acceptor.accept(stream),
            );
            let tls_stream = match handshake.await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(err)) => {
                    if shared.app.throttle.should_log(&format!("tls:{}", peer.ip())) {
                        warn!("TLS handshake with {peer} failed: {err}");
                    }
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake with {peer} timed out");
                    return;
                }
            };
            let has_client_cert = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| !certs.is_empty())
                .unwrap_or(false);
            serve(shared, TokioIo::new(tls_stream), peer, has_client_cert, cancel).await;
        }
        None => serve(shared, TokioIo::new(stream), peer, false, cancel).await,
    }
}

async fn serve<IO>(
    shared: Arc<Shared>,
    io: IO,
    peer: SocketAddr,
    has_client_cert: bool,
    cancel: CancellationToken,
) where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
{
    let service_shared = shared.clone();
    let service = service_fn(move |req| {
        let shared = service_shared.clone();
        async move {
            Ok::<_, std::convert::Infallible>(
                handle_request(shared, peer, has_client_cert, req).await,
            )
        }
    });

    let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!("connection with {peer} ended: {err}");
            }
        }
        _ = cancel.cancelled() => {
            // Finish the in-flight request, then close.
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

// ── Request handling ──────────────────────────────────────────────────────────

async fn handle_request(
    shared: Arc<Shared>,
    peer: SocketAddr,
    has_client_cert: bool,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    // Mutual TLS: a configured client CA makes the certificate mandatory.
    if shared.cfg.http.tls_clients_ca_file.is_some() && !has_client_cert {
        return text_response(
            StatusCode::FORBIDDEN,
            "client certificate validation failed: no certificate presented\n",
        );
    }

    // Basic auth against the htpasswd database.
    let authenticated_user = match &shared.htpasswd {
        Some(db) => {
            let credentials = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_basic_authorization);
            match credentials {
                Some((user, password)) if db.authenticate(&user, &password) => Some(user),
                _ => return unauthorized_response(),
            }
        }
        None => None,
    };

    if req.method() == Method::POST {
        handle_post(shared, peer, authenticated_user, req).await
    } else if req.method() == Method::GET {
        handle_get(req)
    } else {
        warn!(
            "received invalid method {} from {peer}, returning method not allowed",
            req.method()
        );
        method_not_allowed_response()
    }
}

/// GET validator endpoint: echo the token after `/v1/meraki/`.
fn handle_get(req: Request<Incoming>) -> Response<Full<Bytes>> {
    match validate_url(req.uri().path()) {
        Ok(token) => text_response(StatusCode::OK, token),
        Err(err) => error_response(err, None),
    }
}

async fn handle_post(
    shared: Arc<Shared>,
    peer: SocketAddr,
    authenticated_user: Option<String>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let headers = req.headers();

    // The consumer id scoping the topic: the credential username when auth is
    // on, else the X-Consumer-ID header an upstream proxy may set.
    let consumer_id = authenticated_user.or_else(|| {
        headers
            .get("x-consumer-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let vars = RequestVars {
        uri: req.uri().path().to_string(),
        client_ip: peer.ip().to_string(),
        consumer_id,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let mut inflater = Inflater::from_headers(headers);

    let default_topic = shared
        .cfg
        .topic
        .as_deref()
        .or(shared.app.default_topic.as_deref());
    let mut session = match shared.cfg.decoder.new_session(
        shared.app.sink.clone(),
        &shared.app.topics,
        default_topic,
        &vars,
        shared.cfg.http.connection_memory_limit,
    ) {
        Ok(session) => session,
        Err(err) => return error_response(err, None),
    };

    // Once an error response is queued, further chunks are dropped but the
    // body is still consumed for protocol correctness.
    let mut queued_error: Option<DecoderError> = None;
    let mut body = req.into_body();

    loop {
        let frame = tokio::time::timeout(shared.cfg.http.connection_timeout, body.frame()).await;
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => {
                debug!("request body from {peer} idle beyond connection timeout");
                return close_response(StatusCode::REQUEST_TIMEOUT);
            }
        };
        let Some(frame) = frame else {
            break; // end of body
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!("request body from {peer} aborted: {err}");
                return close_response(StatusCode::BAD_REQUEST);
            }
        };
        let Ok(data) = frame.into_data() else {
            continue; // trailers
        };
        if queued_error.is_some() {
            continue;
        }

        let feed_result = match &mut inflater {
            Some(inflater) => match inflater.feed(&data) {
                Ok(inflated) if inflated.is_empty() => Ok(()),
                Ok(inflated) => session.on_chunk(Bytes::from(inflated)),
                Err(err) => {
                    if shared
                        .app
                        .throttle
                        .should_log(&format!("inflate:{}", peer.ip()))
                    {
                        error!("compressed request error from client {}: {err}", peer.ip());
                    }
                    Err(map_inflate_error(&err))
                }
            },
            None => session.on_chunk(data),
        };

        if let Err(err) = feed_result {
            queued_error = Some(err);
        }
    }

    if queued_error.is_none() {
        if let Err(err) = session.end_of_body() {
            queued_error = Some(err);
        }
    }

    let response_body = session.response_body();
    match queued_error {
        Some(err) => error_response(err, response_body),
        None => match response_body {
            Some(response) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, response.content_type)
                .body(Full::new(Bytes::from(response.body)))
                .expect("static response"),
            None => text_response(StatusCode::OK, ""),
        },
    }
}

// ── Inflate support ───────────────────────────────────────────────────────────

/// Incremental request-body inflater selected by Content-Encoding.
enum Inflater {
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
}

impl Inflater {
    /// Returns None when the body is not compressed. Unknown encodings are
    /// passed through untouched, matching the uncompressed path.
    fn from_headers(headers: &http::HeaderMap) -> Option<Self> {
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())?;
        match encoding.to_ascii_lowercase().as_str() {
            "deflate" => Some(Inflater::Deflate(flate2::write::ZlibDecoder::new(
                Vec::new(),
            ))),
            "gzip" => Some(Inflater::Gzip(flate2::write::GzDecoder::new(Vec::new()))),
            _ => None,
        }
    }

    /// Push compressed bytes in, take whatever inflated output is ready.
    fn feed(&mut self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Inflater::Deflate(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Inflater::Gzip(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

fn map_inflate_error(err: &std::io::Error) -> DecoderError {
    match err.kind() {
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
            DecoderError::InvalidRequest
        }
        _ => DecoderError::GenericError,
    }
}

// ── Response builders ─────────────────────────────────────────────────────────

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}

fn close_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn unauthorized_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, WWW_AUTHENTICATE_BASIC)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn method_not_allowed_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(header::ALLOW, ALLOWED_METHODS)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn error_response(
    err: DecoderError,
    body: Option<crate::decode::ResponseBody>,
) -> Response<Full<Bytes>> {
    let status = err.http_status();
    if status == StatusCode::METHOD_NOT_ALLOWED {
        return method_not_allowed_response();
    }
    match body {
        Some(response) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, response.content_type)
            .body(Full::new(Bytes::from(response.body)))
            .expect("static response"),
        None => text_response(status, &format!("{err}\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    #[test]
    fn inflater_selection_by_content_encoding() {
        let mut headers = http::HeaderMap::new();
        assert!(Inflater::from_headers(&headers).is_none());

        headers.insert(header::CONTENT_ENCODING, "deflate".parse().unwrap());
        assert!(matches!(
            Inflater::from_headers(&headers),
            Some(Inflater::Deflate(_))
        ));

        headers.insert(header::CONTENT_ENCODING, "GZIP".parse().unwrap());
        assert!(matches!(
            Inflater::from_headers(&headers),
            Some(Inflater::Gzip(_))
        ));

        headers.insert(header::CONTENT_ENCODING, "br".parse().unwrap());
        assert!(Inflater::from_headers(&headers).is_none());
    }

    #[test]
    fn deflate_roundtrip_in_pieces() {
        let payload = br#"{"a":1}{"b":2}"#;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut inflater = Inflater::Deflate(flate2::write::ZlibDecoder::new(Vec::new()));
        let mut out = Vec::new();
        for piece in compressed.chunks(3) {
            out.extend(inflater.feed(piece).unwrap());
        }
        assert_eq!(&out[..], payload);
    }

    #[test]
    fn gzip_roundtrip() {
        let payload = br#"{"client_mac":"54:26:96:db:88:01","a":5}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut inflater = Inflater::Gzip(flate2::write::GzDecoder::new(Vec::new()));
        let mut out = Vec::new();
        for piece in compressed.chunks(7) {
            out.extend(inflater.feed(piece).unwrap());
        }
        assert_eq!(&out[..], payload);
    }

    #[test]
    fn corrupt_deflate_maps_to_invalid_request() {
        let mut inflater = Inflater::Deflate(flate2::write::ZlibDecoder::new(Vec::new()));
        let err = inflater
            .feed(b"definitely not zlib data at all")
            .unwrap_err();
        assert_eq!(map_inflate_error(&err), DecoderError::InvalidRequest);
    }

    #[test]
    fn method_not_allowed_carries_allow_header() {
        let response = method_not_allowed_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST");
    }

    #[test]
    fn unauthorized_carries_www_authenticate() {
        let response = unauthorized_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            WWW_AUTHENTICATE_BASIC
        );
    }
}
