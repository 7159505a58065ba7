use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const USER_AGENT: &str = concat!("Portico/", env!("CARGO_PKG_VERSION"));

/// Upstream HTTP client using Hyper with Rustls (HTTP/1.1).
///
/// Built once at startup and shared by every request; the underlying
/// connection pool lives as long as the adapter. Timeouts are applied by the
/// caller, and nothing is retried.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::debug!("Created upstream HTTP client");
        Ok(Self { client })
    }

    /// Point the Host header at the upstream and fill in a User-Agent if absent.
    fn prepare_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let host_header = match (req.uri().host(), req.uri().port_u16()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "Outgoing URI has no host: {}",
                    req.uri()
                )));
            }
        };
        let host_value = HeaderValue::from_str(&host_header)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let headers = req.headers_mut();
        headers.insert(header::HOST, host_value);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::prepare_headers(&mut req)?;

        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let (mut parts, body) = req.into_parts();
        // ALPN negotiates the actual version.
        parts.version = Version::HTTP_11;

        tracing::debug!(
            upstream = %upstream,
            method = %parts.method,
            path = %parts.uri.path(),
            "Forwarding request upstream"
        );

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is decoded here; framing is re-done by the server side.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::warn!(
                    upstream = %upstream,
                    "Upstream request {} {} failed: {}",
                    method,
                    uri,
                    e
                );
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[test]
    fn test_prepare_headers_sets_host_and_agent() {
        let mut req = Request::builder()
            .uri("https://api.acme.test:8443/users")
            .header(header::HOST, "acme.portico.test")
            .body(AxumBody::empty())
            .unwrap();

        HttpClientAdapter::prepare_headers(&mut req).unwrap();

        assert_eq!(req.headers()[header::HOST], "api.acme.test:8443");
        assert_eq!(req.headers()[header::USER_AGENT], USER_AGENT);
    }

    #[test]
    fn test_prepare_headers_rejects_relative_uri() {
        let mut req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            HttpClientAdapter::prepare_headers(&mut req),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_connection_error() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("http://127.0.0.1:1/")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }
}
