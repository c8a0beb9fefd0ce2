//! Proxy server implementation
//! Identifies the device behind each request, then answers it directly, forwards it to the
//! vendor, or forwards it and rewrites the response

use crate::config::ProxyConfig;
use crate::device::{Action, ItemType, Verb};
use crate::document::Document;
use crate::engine::RewriteEngine;
use crate::registry::{Device, Registry};
use crate::upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Path of the item polling call
pub const GET_ITEMS_PATH: &str = "/FionaTodoListProxy/getItems";
/// Path of the snapshot upload a first-contact device is told to perform
pub const UPLOAD_SNAPSHOT_PATH: &str = "/FionaCDEServiceEngine/UploadSnapshot";

/// Answer to `getItems?reason=Poll`, whatever the device
pub const POLL_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><response><total_count>0</total_count><items/></response>"#;

const XML_CONTENT_TYPE: &str = "text/xml;charset=UTF-8";

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    registry: Arc<Registry>,
    engine: Arc<RewriteEngine>,
    upstream: UpstreamClient,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, registry: Arc<Registry>, engine: Arc<RewriteEngine>) -> Self {
        let upstream = UpstreamClient::new(config.upstream_timeout);
        Self {
            config,
            registry,
            engine,
            upstream,
        }
    }

    /// The device registry this server resolves requests against
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Result<ProxyResponse, Infallible> {
        match self.process_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {:#}", e);
                Ok(Self::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    /// Process request
    async fn process_request(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Result<ProxyResponse> {
        let path = req.uri().path().to_string();

        debug!("{} {} from {}", req.method(), path, remote_addr);

        // Health check endpoint
        if path == "/health" {
            return Ok(Self::text_response(StatusCode::OK, "OK"));
        }

        let ip = self.client_ip(req.headers(), remote_addr);
        let cookie = req
            .headers()
            .get(COOKIE)
            .and_then(|c| c.to_str().ok())
            .map(str::to_string);
        let device = self.registry.detect(Some(&ip), cookie.as_deref());

        if path.starts_with(GET_ITEMS_PATH) {
            return self.get_items(req, &device).await;
        }
        if path == UPLOAD_SNAPSHOT_PATH {
            return self.upload_snapshot(req, &device).await;
        }

        let (parts, body) = Self::read_request(req).await?;
        match self.call_upstream(parts, body, &device).await {
            Ok(upstream) => Self::upstream_response(upstream.status, &upstream.headers, upstream.body),
            Err(response) => Ok(response),
        }
    }

    /// Poll for pending items, rewriting what the vendor answers
    async fn get_items(&self, req: Request<Incoming>, device: &Device) -> Result<ProxyResponse> {
        if query_param(req.uri().query(), "reason").as_deref() == Some("Poll") {
            return Ok(Self::xml_response(Bytes::from_static(POLL_RESPONSE.as_bytes())));
        }

        if device.lock().is_provisional() {
            // make the device upload a snapshot, which tells us its serial
            info!("Asking unknown device {} for a snapshot", device.lock().serial);
            let doc = self.engine.first_contact_response();
            return Ok(Self::xml_response(Bytes::from(doc.to_bytes()?)));
        }

        let (parts, body) = Self::read_request(req).await?;
        let upstream = match self.call_upstream(parts, body, device).await {
            Ok(upstream) => upstream,
            Err(response) => return Ok(response),
        };

        let mut body = upstream.body;
        if upstream.status == StatusCode::OK {
            match Document::parse(&body) {
                Ok(mut doc) => {
                    let (updated, configured) = {
                        let mut record = device.lock();
                        let before = record.configuration_updated;
                        let updated = self.engine.process_response(&mut doc, &mut record);
                        (updated, !before && record.configuration_updated)
                    };
                    if configured {
                        self.registry.save(device);
                    }
                    if updated {
                        body = Bytes::from(doc.to_bytes().context("Failed to serialize getItems response")?);
                    }
                }
                Err(e) => warn!("Passing through unparseable getItems response: {}", e),
            }
        }

        Self::upstream_response(upstream.status, &upstream.headers, body)
    }

    /// Snapshot upload; from an unidentified device it carries the serial we are after
    async fn upload_snapshot(&self, req: Request<Incoming>, device: &Device) -> Result<ProxyResponse> {
        let (parts, body) = Self::read_request(req).await?;

        if !device.lock().is_provisional() {
            return match self.call_upstream(parts, body, device).await {
                Ok(upstream) => Self::upstream_response(upstream.status, &upstream.headers, upstream.body),
                Err(response) => Ok(response),
            };
        }

        let serial = match snapshot_serial(&body) {
            Some(serial) => serial,
            None => {
                warn!("Snapshot from {} carries no serial", device.lock());
                return Ok(Self::error_response(StatusCode::BAD_REQUEST, "Missing device serial"));
            }
        };

        let confirmed = match self.registry.confirm_device(device, &serial) {
            Ok(Some(confirmed)) => confirmed,
            // no certificate yet: keep the device and let a later request finish the job
            Ok(None) => device.clone(),
            Err(e) => {
                error!("{}", e);
                return Ok(Self::error_response(StatusCode::CONFLICT, "Device already identified"));
            }
        };

        {
            let mut record = confirmed.lock();
            if !record.configuration_updated {
                record.actions.push(Action::new(Verb::Set, ItemType::Scfg));
            }
        }

        let has_context = confirmed.lock().tls_context.is_some();
        if has_context {
            return match self.call_upstream(parts, body, &confirmed).await {
                Ok(upstream) => Self::upstream_response(upstream.status, &upstream.headers, upstream.body),
                Err(response) => Ok(response),
            };
        }

        Ok(Self::text_response(StatusCode::OK, ""))
    }

    /// Forward a request to the vendor with the device's certificate.
    ///
    /// The device lock is only held to copy the TLS context out, never across the call.
    /// On failure the error is already turned into a response for the device.
    async fn call_upstream(&self, parts: Parts, body: Bytes, device: &Device) -> Result<UpstreamResponse, ProxyResponse> {
        let (serial, tls) = {
            let record = device.lock();
            (record.serial.clone(), record.tls_context.clone())
        };
        let path = parts.uri.path().to_string();

        let tls = match tls {
            Some(tls) => tls,
            None => {
                warn!("No TLS context for device {}, refusing {}", serial, path);
                return Err(Self::error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"));
            }
        };

        let base = match self.config.upstreams.for_path(&path) {
            Some(base) => base,
            None => return Err(Self::error_response(StatusCode::NOT_FOUND, "Not Found")),
        };

        let request = UpstreamRequest {
            method: parts.method,
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or(path),
            headers: parts.headers,
            body,
        };

        match self.upstream.send(base, request, Some(&tls)).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Upstream call for device {} failed: {:#}", serial, e);
                Err(Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }

    /// Split a request and collect its body
    async fn read_request(req: Request<Incoming>) -> Result<(Parts, Bytes)> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .context("Failed to read request body")?
            .to_bytes();
        Ok((parts, body))
    }

    /// Client ip, optionally taken from the first `X-Forwarded-For` entry
    fn client_ip(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> String {
        if self.config.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.split(',').next())
                .map(str::trim)
                .filter(|ip| !ip.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        remote_addr.ip().to_string()
    }

    /// Relay an upstream answer; length and framing headers are recomputed for the new body
    fn upstream_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Result<ProxyResponse> {
        let mut builder = Response::builder().status(status);

        for (key, value) in headers.iter() {
            if key != CONTENT_LENGTH && key != TRANSFER_ENCODING && key != CONNECTION {
                builder = builder.header(key, value);
            }
        }

        builder
            .body(Self::full_body(body))
            .context("Failed to build response")
    }

    /// Create XML response
    fn xml_response(body: Bytes) -> ProxyResponse {
        let mut response = Response::new(Self::full_body(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
        response
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> ProxyResponse {
        let mut response = Response::new(Self::full_body(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
        Self::text_response(status, message)
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
        Full::new(bytes)
            .map_err(|never| match never {})
            .boxed()
    }
}

/// First value of a query parameter
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Device serial from an uploaded snapshot: the first `<serial>` element
fn snapshot_serial(body: &[u8]) -> Option<String> {
    let doc = Document::parse(body).ok()?;
    let serial = doc.root.find("serial")?.text().trim().to_string();
    if serial.is_empty() {
        None
    } else {
        Some(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("reason=Poll&x=1"), "reason").as_deref(), Some("Poll"));
        assert_eq!(query_param(Some("x=1&reason=Wake%20up"), "reason").as_deref(), Some("Wake up"));
        assert_eq!(query_param(Some("x=1"), "reason"), None);
        assert_eq!(query_param(None, "reason"), None);
    }

    #[test]
    fn test_snapshot_serial() {
        let body = br#"<?xml version="1.0"?><snapshot><device><serial> B0171234 </serial></device></snapshot>"#;
        assert_eq!(snapshot_serial(body).as_deref(), Some("B0171234"));
        assert_eq!(snapshot_serial(b"<snapshot><serial></serial></snapshot>"), None);
        assert_eq!(snapshot_serial(b"<snapshot/>"), None);
        assert_eq!(snapshot_serial(b"not xml <"), None);
    }

    #[test]
    fn test_poll_response_is_minimal() {
        let doc = Document::parse(POLL_RESPONSE.as_bytes()).unwrap();
        assert_eq!(doc.root.child("total_count").unwrap().text(), "0");
        assert_eq!(doc.root.child("items").unwrap().elements().count(), 0);
        assert_eq!(doc.to_bytes().unwrap(), POLL_RESPONSE.as_bytes());
    }

    #[test]
    fn test_upstream_response_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));

        let response = ProxyServer::upstream_response(StatusCode::OK, &headers, Bytes::from_static(b"<a/>")).unwrap();
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert!(response.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(response.headers()[CONTENT_TYPE], XML_CONTENT_TYPE);
    }
}
