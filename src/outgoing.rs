use crate::common::{has_port, has_upgrade_token, is_ssl, requires_port, url_join};
use crate::error::ProxyError;
use crate::options::{ProxyOptions, TlsMaterial, url_authority};
use crate::transport::Agent;
use http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, HeaderName,
    HeaderValue, PROXY_AUTHORIZATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode, request};
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

/// Everything needed to issue one upstream request.
///
/// Built fresh for every call from the inbound request and the effective
/// options, handed to `proxy_req` listeners for inspection, then consumed by
/// the transport.
#[derive(Debug, Clone, Default)]
pub struct OutgoingRequest {
    /// Scheme with trailing colon, e.g. `https:`.
    pub protocol: String,
    pub host: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    pub socket_path: Option<PathBuf>,
    pub tls: TlsMaterial,
    pub method: Method,
    pub headers: HeaderMap,
    pub path: String,
    pub agent: Option<Agent>,
    pub local_address: Option<IpAddr>,
    pub auth: Option<String>,
    pub ca: Option<String>,
    pub reject_unauthorized: Option<bool>,
}

impl OutgoingRequest {
    /// Derives the upstream request for `request` from `options`.
    ///
    /// `use_forward` selects the `forward` location instead of `target`.
    /// `base_tls` is the proxy-wide `ssl` material; TLS fields on the selected
    /// location replace it field by field.
    pub fn build(
        base_tls: Option<&TlsMaterial>,
        options: &ProxyOptions,
        request: &request::Parts,
        use_forward: bool,
    ) -> Result<Self, ProxyError> {
        let location = if use_forward {
            options.forward_location()
        } else {
            options.target_location()
        }
        .ok_or_else(|| {
            let which = if use_forward { "forward" } else { "target" };
            ProxyError::Config(format!("No {} location to proxy to", which))
        })?;

        let protocol = location
            .protocol
            .clone()
            .unwrap_or_else(|| "http:".to_string());
        let port = location
            .port
            .unwrap_or(if is_ssl(&protocol) { 443 } else { 80 });

        let method = match &options.method {
            Some(method) => Method::from_bytes(method.as_bytes())
                .map_err(|e| ProxyError::Config(format!("Invalid method '{}': {}", method, e)))?,
            None => request.method.clone(),
        };

        let mut headers = request.headers.clone();
        if let Some(extra) = &options.headers {
            for (name, value) in extra {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ProxyError::Config(format!("Invalid header name '{}': {}", name, e)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| ProxyError::Config(format!("Invalid value for header '{}': {}", name, e)))?;
                headers.insert(name, value);
            }
        }

        let agent = options.agent.clone();
        if agent.is_none() {
            let upgrading = headers
                .get(CONNECTION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(has_upgrade_token);
            if !upgrading {
                headers.insert(CONNECTION, HeaderValue::from_static("close"));
            }
        }

        let reject_unauthorized = if is_ssl(&protocol) {
            Some(options.verify_upstream_tls())
        } else {
            None
        };

        let target_path = if options.prepends_path() {
            location.path.clone().unwrap_or_default()
        } else {
            String::new()
        };
        let request_path = if options.ignores_path() {
            String::new()
        } else if options.proxies_to_proxy() {
            request.uri.to_string()
        } else {
            request
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default()
        };
        let path = url_join(&[&target_path, &request_path]);

        if options.changes_origin() {
            if let Some(host) = location.host.as_deref().or(location.hostname.as_deref()) {
                let value = if requires_port(port, &protocol) && !has_port(host) {
                    format!("{}:{}", host, port)
                } else {
                    host.to_string()
                };
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| ProxyError::Config(format!("Invalid host '{}': {}", value, e)))?;
                headers.insert(HOST, value);
            }
        }

        let tls = match base_tls {
            Some(base) => base.overlaid_with(&location.tls),
            None => location.tls.clone(),
        };

        Ok(OutgoingRequest {
            protocol,
            host: location.host.clone(),
            hostname: location.hostname.clone(),
            port,
            socket_path: location.socket_path.clone(),
            tls,
            method,
            headers,
            path,
            agent,
            local_address: options.local_address,
            auth: options.auth.clone(),
            ca: options.ca.clone(),
            reject_unauthorized,
        })
    }

    /// Points this request at the `location` an upstream answered `status`
    /// with, resolved against the current URL.
    ///
    /// Returns false when the body must not be replayed: a POST after 301 or
    /// 302, and anything but GET or HEAD after 303, becomes a bodiless GET.
    /// Credentials are dropped when the redirect leaves the current host.
    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result<bool, ProxyError> {
        let scheme = if self.is_secure() { "https" } else { "http" };
        let current = Url::parse(&format!(
            "{}://{}:{}{}",
            scheme,
            self.connect_host(),
            self.port,
            self.path
        ))?;
        let next = current.join(location)?;
        let hostname = next
            .host_str()
            .ok_or_else(|| ProxyError::Http(format!("Redirect to '{}' has no host", location)))?;

        if hostname != self.connect_host() {
            for name in [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION] {
                self.headers.remove(name);
            }
            self.auth = None;
        }
        if next.host_str() != current.host_str() || next.port_or_known_default() != Some(self.port) {
            self.socket_path = None;
        }

        self.protocol = format!("{}:", next.scheme());
        self.hostname = Some(hostname.to_string());
        self.host = url_authority(&next);
        self.port = next
            .port_or_known_default()
            .unwrap_or(if is_ssl(&self.protocol) { 443 } else { 80 });
        self.path = match next.query() {
            Some(query) => format!("{}?{}", next.path(), query),
            None => next.path().to_string(),
        };
        if let Some(authority) = &self.host {
            let value = HeaderValue::from_str(authority)
                .map_err(|e| ProxyError::Http(format!("Invalid redirect host '{}': {}", authority, e)))?;
            self.headers.insert(HOST, value);
        }

        let replay = match status.as_u16() {
            301 | 302 => self.method != Method::POST,
            303 => self.method == Method::GET || self.method == Method::HEAD,
            _ => true,
        };
        if !replay {
            self.method = Method::GET;
            for name in [CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING] {
                self.headers.remove(name);
            }
        }
        Ok(replay)
    }

    pub fn is_secure(&self) -> bool {
        is_ssl(&self.protocol)
    }

    /// Name to open the connection to: `hostname`, else `host` without its
    /// port.
    pub fn connect_host(&self) -> &str {
        if let Some(hostname) = self.hostname.as_deref() {
            return hostname;
        }
        match self.host.as_deref() {
            Some(host) if has_port(host) => host.rsplit_once(':').map_or(host, |(name, _)| name),
            Some(host) => host,
            None => "localhost",
        }
    }

    /// `scheme://host:port`, or `unix:<path>` for socket targets.
    pub fn origin(&self) -> String {
        if let Some(socket) = &self.socket_path {
            return format!("unix:{}", socket.display());
        }
        let scheme = if self.protocol.is_empty() {
            "http"
        } else {
            self.protocol.trim_end_matches(':')
        };
        format!("{}://{}:{}", scheme, self.connect_host(), self.port)
    }
}
