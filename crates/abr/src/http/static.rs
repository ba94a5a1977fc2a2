use std::{
    collections::{HashMap, VecDeque},
    sync::{mpsc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{ConnectionInfo, HttpEvent, HttpHandle, HttpRequest, HttpResponse, HttpTransport};

/// A canned response served by [`StaticTransport`].
#[derive(Debug, Clone)]
pub struct StaticResponse {
    /// `0` simulates a connection failure.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub etag: Option<String>,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl StaticResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            etag: None,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Bytes::new())
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Delivers the body in `chunk_size` pieces with `delay` between them.
    pub fn with_chunks(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = delay;
        self
    }
}

/// An in-memory [`HttpTransport`] serving responses from a route table.
///
/// Unknown URLs answer with `404`. Byte ranges are honoured with `206` and `If-None-Match`
/// with `304` when the route carries an ETag.
#[derive(Debug, Default)]
pub struct StaticTransport {
    once: Mutex<HashMap<String, VecDeque<StaticResponse>>>,
    routes: Mutex<HashMap<String, StaticResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: impl Into<String>, response: StaticResponse) {
        self.routes.lock().unwrap().insert(url.into(), response);
    }

    /// Queues a response that is served once before the permanent route.
    pub fn route_once(&self, url: impl Into<String>, response: StaticResponse) {
        self.once
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    fn lookup(&self, url: &str) -> Option<StaticResponse> {
        if let Some(response) = self
            .once
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
        {
            return Some(response);
        }
        self.routes.lock().unwrap().get(url).cloned()
    }
}

impl HttpTransport for StaticTransport {
    fn start(&self, request: HttpRequest) -> HttpHandle {
        self.requests.lock().unwrap().push(request.clone());
        let (sender, receiver) = mpsc::channel();
        let cancel = CancellationToken::new();

        let Some(route) = self.lookup(&request.url) else {
            _ = sender.send(HttpEvent::Completed(plain_response(&request, 404)));
            return HttpHandle::new(receiver, cancel);
        };
        if route.status == 0 {
            _ = sender.send(HttpEvent::Completed(HttpResponse::failed(
                &request.url,
                "connection refused",
            )));
            return HttpHandle::new(receiver, cancel);
        }

        let (status, body) = resolve_body(&request, &route);
        let mut headers = route.headers.clone();
        if let Some(etag) = &route.etag {
            headers.push(("ETag".to_string(), etag.clone()));
        }
        if !(200..300).contains(&status) {
            let mut response = plain_response(&request, status);
            response.headers = headers;
            _ = sender.send(HttpEvent::Completed(response));
            return HttpHandle::new(receiver, cancel);
        }

        let token = cancel.clone();
        let deliver = move || {
            let started = Instant::now();
            let mut info = ConnectionInfo {
                status,
                effective_url: request.url.clone(),
                content_length: Some(body.len() as u64),
                ..Default::default()
            };
            let mut offset = 0;
            while offset < body.len() {
                if token.is_cancelled() {
                    info.was_aborted = true;
                    info.error = Some("aborted".to_string());
                    break;
                }
                if !route.chunk_delay.is_zero() {
                    thread::sleep(route.chunk_delay);
                }
                let end = (offset + route.chunk_size).min(body.len());
                if request.streaming {
                    if sender.send(HttpEvent::Data(body.slice(offset..end))).is_err() {
                        info.was_aborted = true;
                        break;
                    }
                }
                if offset == 0 {
                    info.time_until_first_byte = started.elapsed();
                }
                info.bytes_read = end as u64;
                offset = end;
            }
            info.total_time = started.elapsed();
            let body = if request.streaming || info.was_aborted {
                Bytes::new()
            } else {
                body
            };
            _ = sender.send(HttpEvent::Completed(HttpResponse {
                info,
                headers,
                body,
            }));
        };
        if route.chunk_delay.is_zero() {
            deliver();
        } else {
            thread::spawn(deliver);
        }
        HttpHandle::new(receiver, cancel)
    }
}

fn plain_response(request: &HttpRequest, status: u16) -> HttpResponse {
    HttpResponse {
        info: ConnectionInfo {
            status,
            effective_url: request.url.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn resolve_body(request: &HttpRequest, route: &StaticResponse) -> (u16, Bytes) {
    if let (Some(etag), Some(if_none_match)) = (&route.etag, request.header("if-none-match")) {
        if etag == if_none_match {
            return (304, Bytes::new());
        }
    }
    if route.status != 200 {
        return (route.status, route.body.clone());
    }
    match request.range {
        None => (200, route.body.clone()),
        Some(range) => {
            let len = route.body.len() as u64;
            if range.offset >= len {
                return (416, Bytes::new());
            }
            let end = range
                .end_inclusive()
                .map(|end| end.min(len - 1))
                .unwrap_or(len - 1);
            (
                206,
                route.body.slice(range.offset as usize..=end as usize),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::fetch_blocking, util::ByteRange};

    #[test]
    fn test_range_and_etag() {
        let transport = StaticTransport::new();
        transport.route(
            "http://cdn/a.mp4",
            StaticResponse::ok(&b"0123456789"[..]).with_etag("\"v1\""),
        );

        let response = fetch_blocking(
            &transport,
            HttpRequest::get("http://cdn/a.mp4").with_range(Some(ByteRange::new(2, Some(3)))),
        );
        assert_eq!(response.status(), 206);
        assert_eq!(&response.body[..], b"234");

        let response = fetch_blocking(
            &transport,
            HttpRequest::get("http://cdn/a.mp4").with_header("If-None-Match", "\"v1\""),
        );
        assert_eq!(response.status(), 304);
        assert_eq!(transport.request_count("http://cdn/a.mp4"), 2);
    }

    #[test]
    fn test_unknown_url_is_404() {
        let transport = StaticTransport::new();
        let response = fetch_blocking(&transport, HttpRequest::get("http://cdn/missing"));
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn test_once_before_route() {
        let transport = StaticTransport::new();
        transport.route("http://cdn/x", StaticResponse::ok("ok"));
        transport.route_once("http://cdn/x", StaticResponse::status(503));
        assert_eq!(fetch_blocking(&transport, HttpRequest::get("http://cdn/x")).status(), 503);
        assert_eq!(fetch_blocking(&transport, HttpRequest::get("http://cdn/x")).status(), 200);
    }
}
