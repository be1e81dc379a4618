use bytes::Bytes;
use http::HeaderMap;
use http::header::HOST;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

static SSL_PROTOCOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https|wss").expect("static regex"));

static UPGRADE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|,)\s*upgrade\s*($|,)").expect("static regex"));

static PORT_IN_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)").expect("static regex"));

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Common response builder utilities to eliminate code duplication
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a standard internal server error response
    pub fn internal_server_error() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// Creates a proxy error response with custom message
    pub fn proxy_error(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, &format!("Proxy Error: {}", message))
    }

    /// Creates an empty response with the given status
    pub fn empty(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(empty_body());
        *response.status_mut() = status;
        response
    }

    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message.to_string()));
        *response.status_mut() = status;
        response
    }
}

/// Whether a protocol string (`https:`, `wss`, ...) denotes an encrypted
/// upstream.
pub fn is_ssl(protocol: &str) -> bool {
    SSL_PROTOCOL.is_match(protocol)
}

/// Whether a `connection` header value carries an `upgrade` token.
pub fn has_upgrade_token(connection: &str) -> bool {
    UPGRADE_TOKEN.is_match(connection)
}

/// Whether `host` already ends in `:<digits>`.
pub fn has_port(host: &str) -> bool {
    host.rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether `port` must be spelled out for `protocol`, i.e. it is not the
/// scheme's default.
pub fn requires_port(port: u16, protocol: &str) -> bool {
    if port == 0 {
        return false;
    }
    let scheme = protocol.split(':').next().unwrap_or_default().to_ascii_lowercase();
    match scheme.as_str() {
        "http" | "ws" => port != 80,
        "https" | "wss" => port != 443,
        "ftp" => port != 21,
        "gopher" => port != 70,
        "file" => false,
        _ => true,
    }
}

/// Port the client connected to: taken from the Host header when it carries
/// one, otherwise the default for the connection's encryption.
pub fn get_port(headers: &HeaderMap, encrypted: bool) -> String {
    let from_host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|host| PORT_IN_HOST.captures(host))
        .map(|caps| caps[1].to_string());

    from_host.unwrap_or_else(|| if encrypted { "443" } else { "80" }.to_string())
}

/// Joins path segments with single slashes.
///
/// The query string of the last segment is set aside before joining and
/// reattached byte for byte afterwards, so `//` or `?` inside it survive.
pub fn url_join(segments: &[&str]) -> String {
    let Some((last, init)) = segments.split_last() else {
        return String::new();
    };

    let (last_path, query) = match last.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (*last, None),
    };

    let joined = init
        .iter()
        .copied()
        .chain(std::iter::once(last_path))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    let mut collapsed = String::with_capacity(joined.len());
    let mut previous_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if !previous_slash {
                collapsed.push(c);
            }
            previous_slash = true;
        } else {
            collapsed.push(c);
            previous_slash = false;
        }
    }

    // Absolute URLs embedded in a path (to_proxy) lose one slash above.
    let mut path = collapsed
        .replacen("http:/", "http://", 1)
        .replacen("https:/", "https://", 1);

    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Rewrites the first `; <property>=<value>` attribute of a cookie header.
///
/// The previous value is looked up in `config` (exact match first, then
/// `*`). A `None` or empty replacement removes the attribute; no match
/// leaves the header untouched.
pub fn rewrite_cookie_property(
    header: &str,
    config: &BTreeMap<String, Option<String>>,
    property: &str,
) -> String {
    let pattern = format!(r"(?i)(;\s*{}=)([^;]+)", regex::escape(property));
    let Ok(re) = Regex::new(&pattern) else {
        return header.to_string();
    };

    re.replacen(header, 1, |caps: &Captures| {
        let previous = &caps[2];
        let replacement = config.get(previous).or_else(|| config.get("*"));
        match replacement {
            None => caps[0].to_string(),
            Some(Some(value)) if !value.is_empty() => format!("{}{}", &caps[1], value),
            Some(_) => String::new(),
        }
    })
    .into_owned()
}

/// Applies [`rewrite_cookie_property`] to every value of a multi-valued
/// `set-cookie` header, keeping order.
pub fn rewrite_cookie_properties(
    headers: &[String],
    config: &BTreeMap<String, Option<String>>,
    property: &str,
) -> Vec<String> {
    headers
        .iter()
        .map(|header| rewrite_cookie_property(header, config, property))
        .collect()
}
