//! The proxy engine: resolves the effective options for a call and runs it
//! through the web or WebSocket pipeline.

use crate::common::{ProxyBody, ResponseBuilder};
use crate::error::ProxyError;
use crate::events::{EventKind, EventRegistry, ProxyEvent};
use crate::options::ProxyOptions;
use crate::passes::{ErrorCallback, WebExchange, WebPass, WsExchange, WsPass, web_incoming, ws_incoming};
use crate::server;
use crate::socket::BoxSocket;
use bytes::Bytes;
use http::request;
use hyper::{Request, Response};
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;

/// Optional arguments of a single proxy call.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Bytes the client sent after the upgrade request head.
    pub head: Option<Bytes>,
    /// Overlaid on the server's options; fields set here win.
    pub overrides: Option<ProxyOptions>,
    pub on_error: Option<ErrorCallback>,
}

impl CallOptions {
    pub fn with_head(mut self, head: Bytes) -> Self {
        self.head = Some(head);
        self
    }

    pub fn with_overrides(mut self, overrides: ProxyOptions) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProxyError, &request::Parts) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// What a call proxies: a plain HTTP request, or an upgrade request together
/// with the client socket it arrived on.
pub enum Inbound {
    Web(Request<ProxyBody>),
    Ws {
        request: Request<()>,
        socket: BoxSocket,
    },
}

pub struct ProxyServer {
    options: ProxyOptions,
    events: Arc<EventRegistry>,
    web_passes: Vec<(&'static str, WebPass)>,
    ws_passes: Vec<(&'static str, WsPass)>,
}

impl ProxyServer {
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options,
            events: Arc::new(EventRegistry::new()),
            web_passes: web_incoming::passes(),
            ws_passes: ws_incoming::passes(),
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Subscribes `listener` to `kind`. Listeners run in subscription order.
    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> &mut Self
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.events).on(kind, listener);
        self
    }

    pub fn web_passes(&self) -> Vec<&'static str> {
        self.web_passes.iter().map(|(name, _)| *name).collect()
    }

    pub fn ws_passes(&self) -> Vec<&'static str> {
        self.ws_passes.iter().map(|(name, _)| *name).collect()
    }

    /// Runs one call through the pipeline matching its kind. Only web calls
    /// produce a response; a WebSocket call owns its socket until the relay
    /// ends.
    pub async fn proxy_request(
        &self,
        inbound: Inbound,
        call: CallOptions,
    ) -> Option<Response<ProxyBody>> {
        match inbound {
            Inbound::Web(request) => Some(self.web(request, call).await),
            Inbound::Ws { request, socket } => {
                self.ws(request, socket, call).await;
                None
            }
        }
    }

    pub async fn web(&self, request: Request<ProxyBody>, call: CallOptions) -> Response<ProxyBody> {
        let (parts, body) = request.into_parts();
        let options = match self.effective_options(call.overrides.as_ref()) {
            Ok(options) => options,
            Err(e) => {
                self.events.emit(&mut ProxyEvent::Error {
                    error: &e,
                    request: &parts,
                });
                return ResponseBuilder::internal_server_error();
            }
        };

        let mut exchange = WebExchange {
            request: parts,
            body: Some(body),
            options,
            events: self.events.clone(),
            on_error: call.on_error,
            deadline: None,
            response: None,
        };

        for (name, pass) in &self.web_passes {
            if pass(&mut exchange).await {
                debug!("Web pass {} handled {}", name, exchange.request.uri);
                break;
            }
        }

        exchange
            .response
            .unwrap_or_else(ResponseBuilder::internal_server_error)
    }

    pub async fn ws(&self, request: Request<()>, socket: BoxSocket, call: CallOptions) {
        let (parts, ()) = request.into_parts();
        let options = match self.effective_options(call.overrides.as_ref()) {
            Ok(options) => options,
            Err(e) => {
                self.events.emit(&mut ProxyEvent::Error {
                    error: &e,
                    request: &parts,
                });
                return;
            }
        };

        let mut exchange = WsExchange {
            request: parts,
            socket: Some(socket),
            head: call.head.unwrap_or_default(),
            options,
            events: self.events.clone(),
            on_error: call.on_error,
        };

        for (name, pass) in &self.ws_passes {
            if pass(&mut exchange).await {
                debug!("WebSocket pass {} handled {}", name, exchange.request.uri);
                break;
            }
        }
    }

    /// Accepts connections on `addr` until the listener fails.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<(), ProxyError> {
        self.listen_with(addr, server::DEFAULT_MAX_HEADER_SIZE).await
    }

    pub async fn listen_with(
        self: Arc<Self>,
        addr: SocketAddr,
        max_header_size: usize,
    ) -> Result<(), ProxyError> {
        info!("Starting proxy listener on {}", addr);
        server::serve(self, addr, max_header_size).await
    }

    fn effective_options(&self, overrides: Option<&ProxyOptions>) -> Result<ProxyOptions, ProxyError> {
        let mut options = match overrides {
            Some(overrides) => self.options.overlay(overrides),
            None => self.options.clone(),
        };
        options.resolve_targets()?;
        Ok(options)
    }
}
