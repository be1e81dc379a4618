//! Lifecycle notifications.
//!
//! Listeners are plain closures keyed by [`EventKind`]. They run
//! synchronously, in the order they were registered, on the task that emits
//! the event. Listeners for `ProxyReq`, `ProxyReqWs` and `ProxyRes` receive
//! mutable access and may rewrite the request or response before it moves on.

use crate::error::ProxyError;
use crate::options::{Location, ProxyOptions};
use crate::outgoing::OutgoingRequest;
use http::{StatusCode, request, response};
use log::error;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Start,
    ProxyReq,
    ProxyReqWs,
    ProxyRes,
    Open,
    /// Deprecated alias of `Open`, emitted right after it.
    ProxySocket,
    Close,
    End,
}

/// The upstream end of an established WebSocket relay.
#[derive(Debug, Clone)]
pub struct UpstreamInfo {
    /// `scheme://host:port` or `unix:<path>`.
    pub origin: String,
}

pub enum ProxyEvent<'a> {
    Error {
        error: &'a ProxyError,
        request: &'a request::Parts,
    },
    Start {
        request: &'a request::Parts,
        target: &'a Location,
    },
    ProxyReq {
        outgoing: &'a mut OutgoingRequest,
        request: &'a request::Parts,
        options: &'a ProxyOptions,
    },
    ProxyReqWs {
        outgoing: &'a mut OutgoingRequest,
        request: &'a request::Parts,
        options: &'a ProxyOptions,
        head: &'a [u8],
    },
    ProxyRes {
        response: &'a mut response::Parts,
        request: &'a request::Parts,
    },
    Open {
        upstream: &'a UpstreamInfo,
    },
    ProxySocket {
        upstream: &'a UpstreamInfo,
    },
    Close {
        response: &'a response::Parts,
        upstream: &'a UpstreamInfo,
        head: &'a [u8],
    },
    End {
        request: &'a request::Parts,
        status: StatusCode,
    },
}

impl ProxyEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Error { .. } => EventKind::Error,
            ProxyEvent::Start { .. } => EventKind::Start,
            ProxyEvent::ProxyReq { .. } => EventKind::ProxyReq,
            ProxyEvent::ProxyReqWs { .. } => EventKind::ProxyReqWs,
            ProxyEvent::ProxyRes { .. } => EventKind::ProxyRes,
            ProxyEvent::Open { .. } => EventKind::Open,
            ProxyEvent::ProxySocket { .. } => EventKind::ProxySocket,
            ProxyEvent::Close { .. } => EventKind::Close,
            ProxyEvent::End { .. } => EventKind::End,
        }
    }
}

pub type Listener = Arc<dyn Fn(&mut ProxyEvent<'_>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventRegistry {
    listeners: HashMap<EventKind, Vec<Listener>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, listener: F)
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.entry(kind).or_default().push(Arc::new(listener));
    }

    /// Delivers `event` to every listener of its kind.
    ///
    /// An error nobody listens for is logged instead of being dropped.
    pub fn emit(&self, event: &mut ProxyEvent<'_>) {
        let kind = event.kind();
        match self.listeners.get(&kind) {
            Some(listeners) if !listeners.is_empty() => {
                for listener in listeners {
                    listener(&mut *event);
                }
            }
            _ => {
                if let ProxyEvent::Error { error: err, request } = event {
                    error!("Unhandled proxy error for {} {}: {}", request.method, request.uri, err);
                }
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self
            .listeners
            .iter()
            .map(|(kind, listeners)| (*kind, listeners.len()))
            .collect();
        counts.sort_by_key(|(kind, _)| format!("{:?}", kind));
        f.debug_struct("EventRegistry").field("listeners", &counts).finish()
    }
}
