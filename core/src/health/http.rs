//! HTTP health endpoint readiness
//!
//! Model servers usually open their port long before they can answer, and
//! report `503` from their health route while weights load. Only a 2xx
//! counts. The body is never read.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, Uri};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::{HealthError, Probe};

/// GET probe against a health URL
///
/// Pooling is disabled so every attempt opens a fresh connection; a kept-alive
/// connection to an earlier instance would otherwise answer for a dead one.
///
/// ```rust
/// use kindling_core::health::{HttpProbe, Probe};
/// use std::time::Duration;
///
/// # async fn example() {
/// let probe = HttpProbe::new("http://127.0.0.1:8001/health", Duration::from_secs(1));
/// let healthy = probe.check().await.is_ok();
/// # let _ = healthy;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
    client: Client<HttpConnector>,
}

impl HttpProbe {
    /// Probe `url`, allowing `timeout` for the response headers
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().pool_max_idle_per_host(0).build_http();
        Self {
            url: url.into(),
            timeout,
            client,
        }
    }

    /// The health URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self) -> Result<Request<Body>, HealthError> {
        let uri: Uri = self.url.parse()?;
        Ok(Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(hyper::header::USER_AGENT, "kindling")
            .body(Body::empty())?)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let request = self.request()?;
        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_elapsed| HealthError::Timeout(self.timeout))??;

        let status = response.status();
        debug!("{} answered {}", self.url, status);
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthError::UnexpectedStatus(status.as_u16()))
        }
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server, StatusCode};
    use std::convert::Infallible;
    use tokio::task;

    async fn start_test_server() -> u16 {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|req| async move {
                let status = match req.uri().path() {
                    "/health" => StatusCode::OK,
                    "/accepted" => StatusCode::ACCEPTED,
                    "/loading" => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::NOT_FOUND,
                };
                let mut response = Response::new(Body::from(status.as_str().to_string()));
                *response.status_mut() = status;
                Ok::<_, Infallible>(response)
            }))
        });

        let addr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&addr).serve(make_svc);
        let port = server.local_addr().port();

        task::spawn(server);

        port
    }

    #[tokio::test]
    async fn test_http_probe_2xx_success() {
        let port = start_test_server().await;

        for path in ["/health", "/accepted"] {
            let url = format!("http://127.0.0.1:{}{}", port, path);
            let probe = HttpProbe::new(url, Duration::from_secs(5));
            let result = probe.check().await;
            assert!(result.is_ok(), "HTTP probe to {path} should succeed: {result:?}");
        }
    }

    #[tokio::test]
    async fn test_http_probe_unexpected_status() {
        let port = start_test_server().await;
        let url = format!("http://127.0.0.1:{}/loading", port);

        let probe = HttpProbe::new(url, Duration::from_secs(5));
        match probe.check().await {
            Err(HealthError::UnexpectedStatus(503)) => {}
            other => panic!("Expected HealthError::UnexpectedStatus(503), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/health"), Duration::from_secs(1));
        match probe.check().await {
            Err(HealthError::Http(_)) => {}
            other => panic!("Expected HealthError::Http, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let probe = HttpProbe::new("not a url", Duration::from_secs(1));
        match probe.check().await {
            Err(HealthError::InvalidUri(_)) => {}
            other => panic!("Expected HealthError::InvalidUri, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_timeout_on_silent_server() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        task::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/health"), Duration::from_millis(100));
        match probe.check().await {
            Err(HealthError::Timeout(d)) => assert_eq!(d, Duration::from_millis(100)),
            other => panic!("Expected HealthError::Timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_http_probe_getters() {
        let probe = HttpProbe::new("http://localhost:8002/health", Duration::from_secs(5));
        assert_eq!(probe.url(), "http://localhost:8002/health");
        assert_eq!(probe.target(), "http://localhost:8002/health");
    }
}
