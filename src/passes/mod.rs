//! Ordered request/response transformation pipelines.
//!
//! A pass receives the exchange for one call and returns `true` once it has
//! fully handled it, which stops the pipeline.

pub mod web_incoming;
pub mod web_outgoing;
pub mod ws_incoming;

use crate::common::{ProxyBody, get_port};
use crate::error::ProxyError;
use crate::events::{EventRegistry, ProxyEvent};
use crate::options::ProxyOptions;
use crate::socket::{BoxSocket, ClientInfo};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::HeaderValue;
use http::{Request, request};
use hyper::Response;
use std::sync::Arc;
use tokio::time::Instant;

/// Per-call error handler. When supplied, live I/O failures go here instead
/// of to the `error` event.
pub type ErrorCallback = Arc<dyn Fn(&ProxyError, &request::Parts) + Send + Sync>;

/// State of one HTTP call as it moves through the web pipeline.
pub struct WebExchange {
    pub request: request::Parts,
    /// Taken by the terminal pass when the request is forwarded.
    pub body: Option<ProxyBody>,
    pub options: ProxyOptions,
    pub events: Arc<EventRegistry>,
    pub on_error: Option<ErrorCallback>,
    /// Latest instant the upstream response may arrive, set by `timeout`.
    pub deadline: Option<Instant>,
    /// Filled in by whichever pass handles the call.
    pub response: Option<Response<ProxyBody>>,
}

/// State of one WebSocket upgrade as it moves through the ws pipeline.
pub struct WsExchange {
    pub request: request::Parts,
    /// `None` once a pass has taken ownership of (or dropped) the socket.
    pub socket: Option<BoxSocket>,
    /// Bytes the client sent after the request head, before the upgrade.
    pub head: Bytes,
    pub options: ProxyOptions,
    pub events: Arc<EventRegistry>,
    pub on_error: Option<ErrorCallback>,
}

pub type WebPass = fn(&mut WebExchange) -> BoxFuture<'_, bool>;

pub type WsPass = fn(&mut WsExchange) -> BoxFuture<'_, bool>;

/// Runs after the upstream response arrives: `(request, response,
/// upstream_response, options)`.
pub type OutgoingPass = fn(
    &request::Parts,
    &mut http::response::Parts,
    &mut http::response::Parts,
    &ProxyOptions,
) -> bool;

pub(crate) fn report_error(
    events: &EventRegistry,
    on_error: Option<&ErrorCallback>,
    error: &ProxyError,
    request: &request::Parts,
) {
    match on_error {
        Some(callback) if error.is_io() => callback(error, request),
        _ => events.emit(&mut ProxyEvent::Error { error, request }),
    }
}

/// Appends this hop to `x-forwarded-{for,port,proto}`.
///
/// Existing values are kept and the new one is comma-joined onto them.
pub(crate) fn append_x_forwarded(request: &mut request::Parts, plain: &str, secure: &str) {
    let client = request
        .extensions
        .get::<ClientInfo>()
        .cloned()
        .unwrap_or_default();
    let proto = if client.encrypted { secure } else { plain };
    let values = [
        ("x-forwarded-for", client.remote_addr.map(|addr| addr.ip().to_string())),
        ("x-forwarded-port", Some(get_port(&request.headers, client.encrypted))),
        ("x-forwarded-proto", Some(proto.to_string())),
    ];

    for (name, value) in values {
        let Some(value) = value else { continue };
        let combined = match request.headers.get(name).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{},{}", existing, value),
            _ => value,
        };
        if let Ok(value) = HeaderValue::from_str(&combined) {
            request.headers.insert(name, value);
        }
    }
}

/// Copy of the request head that a detached task can own.
pub(crate) fn detach_parts(parts: &request::Parts) -> request::Parts {
    let mut request = Request::new(());
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    if let Some(client) = parts.extensions.get::<ClientInfo>() {
        request.extensions_mut().insert(client.clone());
    }
    request.into_parts().0
}
