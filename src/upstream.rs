//! Upstream client
//! Sends a device's request on to the vendor service, presenting the device's certificate

use crate::certificate::TlsContext;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT_ENCODING, CONNECTION, HOST};
use hyper::{HeaderMap, Method, Request, StatusCode, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

/// A request to replay against the upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully read upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP/1.1 client for the vendor services
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Send a request to `base`, giving up after the configured timeout.
    ///
    /// `https` bases require a TLS context; plain `http` bases ignore it.
    pub async fn send(&self, base: &str, request: UpstreamRequest, tls: Option<&TlsContext>) -> Result<UpstreamResponse> {
        tokio::time::timeout(self.timeout, Self::exchange(base, request, tls))
            .await
            .map_err(|_| anyhow!("Upstream {} timed out after {:?}", base, self.timeout))?
    }

    async fn exchange(base: &str, request: UpstreamRequest, tls: Option<&TlsContext>) -> Result<UpstreamResponse> {
        let url = Url::parse(base).with_context(|| format!("Invalid upstream url {}", base))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Upstream url {} has no host", base))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let request = Self::build_request(&url, &host, request)?;

        debug!("Forwarding {} {} to {}", request.method(), request.uri(), base);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        match url.scheme() {
            "https" => {
                let tls = tls.ok_or_else(|| anyhow!("No TLS context to talk to {}", host))?;
                let server_name = ServerName::try_from(host.as_str())
                    .map_err(|e| anyhow!("Invalid upstream host {}: {}", host, e))?
                    .to_owned();
                let stream = TlsConnector::from(tls.config())
                    .connect(server_name, stream)
                    .await
                    .with_context(|| format!("TLS handshake with {} failed", host))?;
                Self::round_trip(stream, request).await
            }
            "http" => Self::round_trip(stream, request).await,
            other => bail!("Unsupported upstream scheme {}", other),
        }
    }

    /// Build the outgoing request; the base url may carry a path prefix
    fn build_request(url: &Url, host: &str, request: UpstreamRequest) -> Result<Request<Full<Bytes>>> {
        let uri = format!("{}{}", url.path().trim_end_matches('/'), request.path_and_query);
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(request.method)
            .uri(uri)
            .version(Version::HTTP_11);

        // responses may be rewritten, so ask for them uncompressed
        for (key, value) in request.headers.iter() {
            if key != HOST && key != CONNECTION && key != ACCEPT_ENCODING {
                builder = builder.header(key, value);
            }
        }
        builder = builder.header(HOST, host_header);

        builder
            .body(Full::new(request.body))
            .context("Failed to build upstream request")
    }

    async fn round_trip<S>(stream: S, request: Request<Full<Bytes>>) -> Result<UpstreamResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("Failed to establish connection to upstream")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection error: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .context("Failed to send request to upstream")?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .context("Failed to read upstream response body")?
            .to_bytes();

        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{COOKIE, HeaderValue};

    fn request(path: &str) -> UpstreamRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("ksp.local"));
        headers.insert(COOKIE, HeaderValue::from_static("session=1"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        UpstreamRequest {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_build_request() {
        let url = Url::parse("https://todo-ta-g7g.amazon.com").unwrap();
        let req = UpstreamClient::build_request(&url, "todo-ta-g7g.amazon.com", request("/FionaTodoListProxy/getItems?reason=Poll")).unwrap();

        assert_eq!(req.uri(), "/FionaTodoListProxy/getItems?reason=Poll");
        assert_eq!(req.headers()[HOST], "todo-ta-g7g.amazon.com");
        assert_eq!(req.headers()[COOKIE], "session=1");
        assert!(req.headers().get(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn test_build_request_with_prefix_and_port() {
        let url = Url::parse("http://127.0.0.1:9000/mock/").unwrap();
        let req = UpstreamClient::build_request(&url, "127.0.0.1", request("/FirsProxy/x")).unwrap();

        assert_eq!(req.uri(), "/mock/FirsProxy/x");
        assert_eq!(req.headers()[HOST], "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_https_requires_context() {
        let client = UpstreamClient::new(Duration::from_millis(500));
        let result = client.send("https://localhost:1", request("/"), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bad_base_url() {
        let client = UpstreamClient::new(Duration::from_secs(1));
        assert!(client.send("not a url", request("/"), None).await.is_err());
    }
}
