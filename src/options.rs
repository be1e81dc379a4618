use crate::error::ProxyError;
use crate::transport::Agent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

/// Redirect hops followed before a call gives up.
pub const DEFAULT_MAX_REDIRECTS: usize = 21;

/// TLS material handed to the upstream connector (and, for `ssl`, to the
/// listener). PEM payloads are carried inline; `pfx` is base64-encoded
/// PKCS#12.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsMaterial {
    #[serde(default)]
    pub pfx: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub ciphers: Option<String>,
    #[serde(default)]
    pub secure_protocol: Option<String>,
}

impl TlsMaterial {
    /// Fields set on `other` replace the ones on `self`.
    pub fn overlaid_with(&self, other: &TlsMaterial) -> TlsMaterial {
        TlsMaterial {
            pfx: other.pfx.clone().or_else(|| self.pfx.clone()),
            key: other.key.clone().or_else(|| self.key.clone()),
            passphrase: other.passphrase.clone().or_else(|| self.passphrase.clone()),
            cert: other.cert.clone().or_else(|| self.cert.clone()),
            ca: other.ca.clone().or_else(|| self.ca.clone()),
            ciphers: other.ciphers.clone().or_else(|| self.ciphers.clone()),
            secure_protocol: other
                .secure_protocol
                .clone()
                .or_else(|| self.secure_protocol.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TlsMaterial::default()
    }
}

/// A resolved upstream location.
///
/// `host` keeps an explicit port (`backend.com:8080`) the way a parsed URL
/// reports it; `hostname` never does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default, flatten)]
    pub tls: TlsMaterial,
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)?;
        Ok(Self::from_url(&url))
    }

    pub fn from_url(url: &Url) -> Self {
        let hostname = url.host_str().map(str::to_string);
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Location {
            protocol: Some(format!("{}:", url.scheme())),
            host: url_authority(url),
            hostname,
            port: url.port(),
            path: Some(path),
            socket_path: None,
            tls: TlsMaterial::default(),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.protocol
            .as_deref()
            .is_some_and(crate::common::is_ssl)
    }

    /// `host[:port]` in the form `url_authority` gives for a parsed URL.
    /// Record-form locations without `host` fall back to `hostname` and a
    /// non-default `port`.
    pub fn authority(&self) -> Option<String> {
        if let Some(host) = &self.host {
            return Some(host.clone());
        }
        let hostname = self.hostname.as_deref()?;
        let default_port = if self.is_secure() { 443 } else { 80 };
        Some(match self.port {
            Some(port) if port != default_port => format!("{}:{}", hostname, port),
            _ => hostname.to_string(),
        })
    }

    /// `scheme://host:port` for log lines and error reports.
    pub fn display_origin(&self) -> String {
        let scheme = self
            .protocol
            .as_deref()
            .map(|p| p.trim_end_matches(':'))
            .unwrap_or("http");
        let host = self
            .hostname
            .as_deref()
            .or(self.host.as_deref())
            .unwrap_or("localhost");
        match (&self.socket_path, self.port) {
            (Some(socket), _) => format!("unix:{}", socket.display()),
            (None, Some(port)) => format!("{}://{}:{}", scheme, host, port),
            (None, None) => format!("{}://{}", scheme, host),
        }
    }
}

/// `host[:port]` as URL parsers report it: the port only when it was spelled
/// out and differs from the scheme default.
pub fn url_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Upstream given either as a URL string or an explicit location record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Url(String),
    Location(Location),
}

impl Target {
    pub fn resolve(&self) -> Result<Location, ProxyError> {
        match self {
            Target::Url(raw) => Location::parse(raw),
            Target::Location(location) => Ok(location.clone()),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Target::Location(location) => Some(location),
            Target::Url(_) => None,
        }
    }
}

impl From<&str> for Target {
    fn from(raw: &str) -> Self {
        Target::Url(raw.to_string())
    }
}

impl From<Location> for Target {
    fn from(location: Location) -> Self {
        Target::Location(location)
    }
}

/// Cookie attribute rewrite rule. A bare string is shorthand for `{"*": value}`.
/// In the map form, a `null` or empty replacement strips the attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CookieRewrite {
    All(String),
    Map(BTreeMap<String, Option<String>>),
}

impl CookieRewrite {
    pub fn mapping(&self) -> BTreeMap<String, Option<String>> {
        match self {
            CookieRewrite::All(value) => {
                BTreeMap::from([("*".to_string(), Some(value.clone()))])
            }
            CookieRewrite::Map(map) => map.clone(),
        }
    }
}

/// Proxy behaviour, fixed per `ProxyServer` and optionally overridden per call.
///
/// Every field is optional so a per-call override can replace exactly the
/// fields it sets; the accessor methods apply the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub forward: Option<Target>,
    /// Pooled client for outbound requests. Without one, every call opens an
    /// unmanaged connection and asks the upstream to close it afterwards.
    #[serde(skip)]
    pub agent: Option<Agent>,
    #[serde(default)]
    pub ssl: Option<TlsMaterial>,
    #[serde(default)]
    pub ws: Option<bool>,
    #[serde(default)]
    pub xfwd: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub to_proxy: Option<bool>,
    #[serde(default)]
    pub prepend_path: Option<bool>,
    #[serde(default)]
    pub ignore_path: Option<bool>,
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    #[serde(default)]
    pub change_origin: Option<bool>,
    #[serde(default)]
    pub preserve_header_key_case: Option<bool>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub host_rewrite: Option<String>,
    #[serde(default)]
    pub auto_rewrite: Option<bool>,
    #[serde(default)]
    pub protocol_rewrite: Option<String>,
    #[serde(default)]
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    #[serde(default)]
    pub cookie_path_rewrite: Option<CookieRewrite>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub ca: Option<String>,
    /// Milliseconds the whole exchange may wait on the upstream response.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Milliseconds the outbound request may take.
    #[serde(default)]
    pub proxy_timeout: Option<u64>,
    /// Chase upstream redirects instead of passing them to the client.
    #[serde(default)]
    pub follow_redirects: Option<bool>,
    #[serde(default)]
    pub max_redirects: Option<usize>,
}

impl ProxyOptions {
    pub fn new(target: impl Into<Target>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    /// Shallow merge: every field set on `overrides` replaces the base value.
    pub fn overlay(&self, overrides: &ProxyOptions) -> ProxyOptions {
        ProxyOptions {
            target: overrides.target.clone().or_else(|| self.target.clone()),
            forward: overrides.forward.clone().or_else(|| self.forward.clone()),
            agent: overrides.agent.clone().or_else(|| self.agent.clone()),
            ssl: overrides.ssl.clone().or_else(|| self.ssl.clone()),
            ws: overrides.ws.or(self.ws),
            xfwd: overrides.xfwd.or(self.xfwd),
            secure: overrides.secure.or(self.secure),
            to_proxy: overrides.to_proxy.or(self.to_proxy),
            prepend_path: overrides.prepend_path.or(self.prepend_path),
            ignore_path: overrides.ignore_path.or(self.ignore_path),
            local_address: overrides.local_address.or(self.local_address),
            change_origin: overrides.change_origin.or(self.change_origin),
            preserve_header_key_case: overrides
                .preserve_header_key_case
                .or(self.preserve_header_key_case),
            auth: overrides.auth.clone().or_else(|| self.auth.clone()),
            host_rewrite: overrides
                .host_rewrite
                .clone()
                .or_else(|| self.host_rewrite.clone()),
            auto_rewrite: overrides.auto_rewrite.or(self.auto_rewrite),
            protocol_rewrite: overrides
                .protocol_rewrite
                .clone()
                .or_else(|| self.protocol_rewrite.clone()),
            cookie_domain_rewrite: overrides
                .cookie_domain_rewrite
                .clone()
                .or_else(|| self.cookie_domain_rewrite.clone()),
            cookie_path_rewrite: overrides
                .cookie_path_rewrite
                .clone()
                .or_else(|| self.cookie_path_rewrite.clone()),
            headers: overrides.headers.clone().or_else(|| self.headers.clone()),
            method: overrides.method.clone().or_else(|| self.method.clone()),
            ca: overrides.ca.clone().or_else(|| self.ca.clone()),
            timeout: overrides.timeout.or(self.timeout),
            proxy_timeout: overrides.proxy_timeout.or(self.proxy_timeout),
            follow_redirects: overrides.follow_redirects.or(self.follow_redirects),
            max_redirects: overrides.max_redirects.or(self.max_redirects),
        }
    }

    /// Replaces URL-string targets with parsed locations.
    ///
    /// Fails when neither `target` nor `forward` ends up as a location.
    pub fn resolve_targets(&mut self) -> Result<(), ProxyError> {
        for slot in [&mut self.target, &mut self.forward] {
            if let Some(target) = slot.as_ref() {
                *slot = match target.resolve() {
                    Ok(location) => Some(Target::Location(location)),
                    Err(e) => {
                        log::warn!("Ignoring unresolvable proxy target: {}", e);
                        None
                    }
                };
            }
        }

        if self.target.is_none() && self.forward.is_none() {
            return Err(ProxyError::Config(
                "Must provide a proper URL as target".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target_location(&self) -> Option<&Location> {
        self.target.as_ref().and_then(Target::location)
    }

    pub fn forward_location(&self) -> Option<&Location> {
        self.forward.as_ref().and_then(Target::location)
    }

    pub fn ws_enabled(&self) -> bool {
        self.ws.unwrap_or(false)
    }

    pub fn xfwd_enabled(&self) -> bool {
        self.xfwd.unwrap_or(false)
    }

    pub fn verify_upstream_tls(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    pub fn prepends_path(&self) -> bool {
        self.prepend_path.unwrap_or(true)
    }

    pub fn ignores_path(&self) -> bool {
        self.ignore_path.unwrap_or(false)
    }

    pub fn proxies_to_proxy(&self) -> bool {
        self.to_proxy.unwrap_or(false)
    }

    pub fn changes_origin(&self) -> bool {
        self.change_origin.unwrap_or(false)
    }

    pub fn preserves_header_key_case(&self) -> bool {
        self.preserve_header_key_case.unwrap_or(false)
    }

    pub fn follows_redirects(&self) -> bool {
        self.follow_redirects.unwrap_or(false)
    }

    pub fn redirect_limit(&self) -> usize {
        self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS)
    }

    pub fn rewrites_redirects(&self) -> bool {
        self.host_rewrite.is_some()
            || self.auto_rewrite.unwrap_or(false)
            || self.protocol_rewrite.is_some()
    }
}
