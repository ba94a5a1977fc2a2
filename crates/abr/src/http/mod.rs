//! HTTP collaborator interface.
//!
//! Workers never block on a transfer directly. A transfer is started with
//! [`HttpTransport::start`], which hands back an [`HttpHandle`] whose channel delivers body
//! chunks (for streaming requests) followed by exactly one [`HttpEvent::Completed`], also when
//! the transfer failed or was aborted.

mod client;
mod retry;
mod r#static;

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use client::ReqwestTransport;
pub use r#static::{StaticResponse, StaticTransport};
pub use retry::{check_for_retry, LoadType};

use crate::{error::PlayerError, params::ParamDict, util::ByteRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub range: Option<ByteRange>,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    pub no_data_timeout: Duration,
    /// Deliver the body as [`HttpEvent::Data`] chunks instead of collecting it.
    pub streaming: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            range: None,
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(8),
            no_data_timeout: Duration::from_secs(6),
            streaming: false,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Applies the connection timeouts configured for `load_type`.
    pub fn with_timeouts(mut self, load_type: LoadType, options: &ParamDict) -> Self {
        let (connect, no_data) = load_type.timeouts(options);
        self.connect_timeout = connect;
        self.no_data_timeout = no_data;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Transfer statistics of a finished request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// HTTP status, `0` if no response was received.
    pub status: u16,
    pub effective_url: String,
    pub content_length: Option<u64>,
    pub bytes_read: u64,
    pub time_until_first_byte: Duration,
    pub total_time: Duration,
    /// Transport reported throughput in bits per second.
    pub throughput_bps: Option<u64>,
    pub error: Option<String>,
    pub was_aborted: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub info: ConnectionInfo,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            info: ConnectionInfo {
                effective_url: url.into(),
                error: Some(error.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn status(&self) -> u16 {
        self.info.status
    }

    pub fn is_success(&self) -> bool {
        self.info.error.is_none() && (200..300).contains(&self.info.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn to_error(&self) -> PlayerError {
        match self.info.status {
            0 => PlayerError::TransportError(
                self.info
                    .error
                    .clone()
                    .unwrap_or_else(|| "no response".to_string()),
            ),
            status => PlayerError::HttpError(status),
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[derive(Debug)]
pub enum HttpEvent {
    Data(Bytes),
    Completed(HttpResponse),
}

pub struct HttpHandle {
    events: Receiver<HttpEvent>,
    cancel: CancellationToken,
}

impl HttpHandle {
    pub fn new(events: Receiver<HttpEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<HttpEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Asks the transport to stop. A `Completed` event with `was_aborted` set still follows.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub trait HttpTransport: Send + Sync + 'static {
    fn start(&self, request: HttpRequest) -> HttpHandle;
}

/// Runs a request to completion on the calling thread.
pub fn fetch_blocking(transport: &dyn HttpTransport, request: HttpRequest) -> HttpResponse {
    fetch_cancellable(transport, request, || false)
}

/// Runs a request to completion, polling `is_canceled` while waiting.
pub fn fetch_cancellable(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    is_canceled: impl Fn() -> bool,
) -> HttpResponse {
    let url = request.url.clone();
    let handle = transport.start(request);
    loop {
        if is_canceled() && !handle.is_aborted() {
            handle.abort();
        }
        match handle.recv_timeout(Duration::from_millis(100)) {
            Ok(HttpEvent::Completed(response)) => return response,
            Ok(HttpEvent::Data(_)) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return HttpResponse::failed(url, "transport dropped the request")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            headers: vec![("ETag".to_string(), "\"abc\"".to_string())],
            ..Default::default()
        };
        assert_eq!(response.header("etag"), Some("\"abc\""));
        assert_eq!(response.header("date"), None);
    }

    #[test]
    fn test_transport_failure_is_not_success() {
        let response = HttpResponse::failed("http://localhost/a", "connection refused");
        assert!(!response.is_success());
        assert!(matches!(response.to_error(), PlayerError::TransportError(_)));
    }
}
