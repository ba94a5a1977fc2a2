use std::{
    sync::{mpsc, Arc},
    time::Instant,
};

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{header::RANGE, Client, Method};
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use super::{ConnectionInfo, HttpEvent, HttpHandle, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::PlayerResult;

/// [`HttpTransport`] backed by `reqwest`.
///
/// Transfers run as tasks on a tokio runtime while the calling worker thread only waits on the
/// returned channel.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    runtime: Handle,
    _owned_runtime: Option<Arc<Runtime>>,
}

impl ReqwestTransport {
    pub fn new(client: Client, runtime: Handle) -> Self {
        Self {
            client,
            runtime,
            _owned_runtime: None,
        }
    }

    /// Creates a transport that owns a small multi-threaded runtime.
    pub fn with_own_runtime(client: Client) -> PlayerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dash-http")
            .enable_all()
            .build()?;
        Ok(Self {
            client,
            runtime: runtime.handle().clone(),
            _owned_runtime: Some(Arc::new(runtime)),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn start(&self, request: HttpRequest) -> HttpHandle {
        let (sender, receiver) = mpsc::channel();
        let cancel = CancellationToken::new();
        let client = self.client.clone();
        let token = cancel.clone();
        self.runtime.spawn(async move {
            let response = execute(client, &request, &sender, token).await;
            _ = sender.send(HttpEvent::Completed(response));
        });
        HttpHandle::new(receiver, cancel)
    }
}

async fn execute(
    client: Client,
    request: &HttpRequest,
    sender: &mpsc::Sender<HttpEvent>,
    cancel: CancellationToken,
) -> HttpResponse {
    let started = Instant::now();
    let method = match request.method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
    };
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(range) = &request.range {
        builder = builder.header(RANGE, range.to_http_range());
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            let mut response = HttpResponse::failed(&request.url, "aborted");
            response.info.was_aborted = true;
            return response;
        }
        result = tokio::time::timeout(request.connect_timeout, builder.send()) => match result {
            Err(_) => {
                tracing::warn!(url = %request.url, "HTTP connection timed out");
                let mut response = HttpResponse::failed(&request.url, "connection timeout");
                response.info.timed_out = true;
                return response;
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %request.url, error = %e, "HTTP request failed");
                return HttpResponse::failed(&request.url, e.to_string());
            }
            Ok(Ok(response)) => response,
        }
    };

    let mut info = ConnectionInfo {
        status: response.status().as_u16(),
        effective_url: response.url().to_string(),
        content_length: response.content_length(),
        time_until_first_byte: started.elapsed(),
        ..Default::default()
    };
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let streaming = request.streaming && response.status().is_success();

    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                info.was_aborted = true;
                info.error = Some("aborted".to_string());
                break;
            }
            chunk = tokio::time::timeout(request.no_data_timeout, stream.next()) => chunk,
        };
        match chunk {
            Err(_) => {
                info.timed_out = true;
                info.error = Some("no data received within timeout".to_string());
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(url = %request.url, error = %e, "Reading response body failed");
                info.error = Some(e.to_string());
                break;
            }
            Ok(Some(Ok(chunk))) => {
                info.bytes_read += chunk.len() as u64;
                if streaming {
                    if sender.send(HttpEvent::Data(chunk)).is_err() {
                        // Nobody is listening anymore.
                        info.was_aborted = true;
                        break;
                    }
                } else {
                    body.extend_from_slice(&chunk);
                }
            }
        }
    }
    info.total_time = started.elapsed();

    HttpResponse {
        info,
        headers,
        body: body.freeze(),
    }
}
