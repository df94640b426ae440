//! Outbound HTTP to peers.
//!
//! Every request is bounded by the configured timeout. Failures are sorted
//! into the three classes the roster cares about: a refused/unreachable peer
//! feeds AWOL tracking, a timeout or anything else is only logged.

use std::time::{Duration, Instant};

use ledger_core::protocol::ROUTE_PING;
use thiserror::Error;

/// Default bound on every outbound request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Connection to {0} refused")]
    Refused(String),

    #[error("Request to {url} failed: {source}")]
    Other {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    /// Whether this failure counts toward AWOL.
    pub fn is_refused(&self) -> bool {
        matches!(self, TransportError::Refused(_))
    }

    fn classify(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(url.to_string())
        } else if err.is_connect() {
            TransportError::Refused(url.to_string())
        } else {
            TransportError::Other {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Request body. Determines the HTTP method.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Bodiless GET
    Empty,
    /// POST with a JSON body
    Json(Vec<u8>),
    /// Bodiless HEAD
    Head,
}

impl Payload {
    /// Serialize a value as a JSON payload.
    pub fn json<T: serde::Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_vec(value).map(Payload::Json)
    }
}

/// A response that made it back, whatever its status.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub status: u16,
    pub body: Vec<u8>,
    /// Wall time from send to full body
    pub elapsed: Duration,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Shared HTTP client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|source| TransportError::Other {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Send one request and read the whole body.
    pub async fn send(&self, url: &str, payload: &Payload) -> Result<Delivery, TransportError> {
        let started = Instant::now();

        let request = match payload {
            Payload::Empty => self.client.get(url),
            Payload::Json(body) => self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
            Payload::Head => self.client.head(url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::classify(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::classify(url, e))?;

        Ok(Delivery {
            status,
            body: body.to_vec(),
            elapsed: started.elapsed(),
        })
    }

    /// Reachability check: `GET {base}/_ping` must answer 200.
    pub async fn probe(&self, base: &str) -> bool {
        let url = format!("{}/{}", base, ROUTE_PING);
        match self.send(&url, &Payload::Empty).await {
            Ok(delivery) => delivery.is_ok(),
            Err(e) => {
                tracing::debug!("Probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport
            .send(&format!("http://{}/_ping", addr), &Payload::Empty)
            .await
            .unwrap_err();

        assert!(err.is_refused(), "expected refused, got {err:?}");
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        assert!(!transport.probe(&format!("http://{}", addr)).await);
    }

    #[test]
    fn test_json_payload() {
        let payload = Payload::json(&serde_json::json!({"a": 1})).unwrap();
        match payload {
            Payload::Json(body) => assert_eq!(body, br#"{"a":1}"#),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
