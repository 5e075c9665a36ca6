//! CameraClient - ESP32-CAM frame acquisition
//!
//! Pulls JPEG frames from the camera module's HTTP capture endpoint and
//! caches the most recent frame for the snapshot route. The detection loop
//! owns pacing and backoff; this client only knows how to fetch.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Camera endpoint configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Camera module base URL, e.g. `http://192.168.1.50`
    pub base_url: String,
    /// Detection cycle interval
    pub poll_interval: Duration,
}

impl CameraConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// CameraClient instance
pub struct CameraClient {
    client: reqwest::Client,
    config: CameraConfig,
    latest: RwLock<Option<Frame>>,
    consecutive_failures: AtomicU64,
}

impl CameraClient {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CAPTURE_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            latest: RwLock::new(None),
            consecutive_failures: AtomicU64::new(0),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Fetch one frame and cache it
    pub async fn capture(&self) -> Result<Frame> {
        let url = format!("{}/capture", self.config.base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await.map_err(|e| {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            Error::Transient(format!("camera capture failed: {}", e))
        })?;

        if !response.status().is_success() {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Transient(format!(
                "camera returned HTTP {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?.to_vec();
        if bytes.is_empty() {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Transient("camera returned empty frame".into()));
        }

        self.consecutive_failures.store(0, Ordering::Relaxed);
        let frame = Frame {
            bytes,
            fetched_at: Utc::now(),
        };
        *self.latest.write().await = Some(frame.clone());
        tracing::debug!(size = frame.bytes.len(), "Camera frame captured");
        Ok(frame)
    }

    /// Most recent successfully captured frame, if any
    pub async fn latest(&self) -> Option<Frame> {
        self.latest.read().await.clone()
    }

    /// Failures since the last successful capture
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(body: Vec<u8>, status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "{}\r\nContent-Length: {}\r\nContent-Type: image/jpeg\r\nConnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn capture_caches_latest_frame() {
        let base = serve_once(vec![0xFF, 0xD8, 0xFF, 0xE0], "HTTP/1.1 200 OK").await;
        let client = CameraClient::new(CameraConfig::new(base)).unwrap();

        let frame = client.capture().await.unwrap();
        assert_eq!(frame.bytes[0], 0xFF);
        assert!(client.latest().await.is_some());
        assert_eq!(client.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn http_error_is_transient_and_counted() {
        let base = serve_once(Vec::new(), "HTTP/1.1 503 Service Unavailable").await;
        let client = CameraClient::new(CameraConfig::new(base)).unwrap();

        assert!(matches!(
            client.capture().await.unwrap_err(),
            Error::Transient(_)
        ));
        assert_eq!(client.consecutive_failures(), 1);
        assert!(client.latest().await.is_none());
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let base = serve_once(Vec::new(), "HTTP/1.1 200 OK").await;
        let client = CameraClient::new(CameraConfig::new(base)).unwrap();
        assert!(matches!(
            client.capture().await.unwrap_err(),
            Error::Transient(_)
        ));
    }
}
