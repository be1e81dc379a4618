//! Passes applied to the upstream response before it is returned.

use super::OutgoingPass;
use crate::common::{has_port, rewrite_cookie_properties};
use crate::options::{CookieRewrite, Location, ProxyOptions, url_authority};
use http::header::{CONNECTION, HOST, HeaderValue, LOCATION, SET_COOKIE, TRANSFER_ENCODING};
use http::{Version, request, response};
use hyper::ext::ReasonPhrase;
use log::debug;
use url::Url;

const REDIRECT_STATUSES: [u16; 5] = [201, 301, 302, 307, 308];

pub fn passes() -> Vec<(&'static str, OutgoingPass)> {
    vec![
        ("remove_chunked", remove_chunked as OutgoingPass),
        ("set_connection", set_connection as OutgoingPass),
        ("set_redirect_host_rewrite", set_redirect_host_rewrite as OutgoingPass),
        ("write_headers", write_headers as OutgoingPass),
        ("write_status_code", write_status_code as OutgoingPass),
    ]
}

/// HTTP/1.0 clients cannot read chunked bodies.
pub fn remove_chunked(
    req: &request::Parts,
    _res: &mut response::Parts,
    proxy_res: &mut response::Parts,
    _options: &ProxyOptions,
) -> bool {
    if req.version == Version::HTTP_10 {
        proxy_res.headers.remove(TRANSFER_ENCODING);
    }
    false
}

pub fn set_connection(
    req: &request::Parts,
    _res: &mut response::Parts,
    proxy_res: &mut response::Parts,
    _options: &ProxyOptions,
) -> bool {
    let inbound = req.headers.get(CONNECTION).cloned();
    if req.version == Version::HTTP_10 {
        proxy_res.headers.insert(
            CONNECTION,
            inbound.unwrap_or_else(|| HeaderValue::from_static("close")),
        );
    } else if req.version != Version::HTTP_2 && !proxy_res.headers.contains_key(CONNECTION) {
        proxy_res.headers.insert(
            CONNECTION,
            inbound.unwrap_or_else(|| HeaderValue::from_static("keep-alive")),
        );
    }
    false
}

/// Rewrites the `location` of a redirect that points back at the target.
///
/// Redirects to any other host are left alone.
pub fn set_redirect_host_rewrite(
    req: &request::Parts,
    _res: &mut response::Parts,
    proxy_res: &mut response::Parts,
    options: &ProxyOptions,
) -> bool {
    if !options.rewrites_redirects() || !REDIRECT_STATUSES.contains(&proxy_res.status.as_u16()) {
        return false;
    }
    let Some(location) = proxy_res.headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(mut url) = Url::parse(location) else {
        return false;
    };

    let target_host = options.target_location().and_then(Location::authority);
    if url_authority(&url) != target_host {
        return false;
    }

    let new_host = match &options.host_rewrite {
        Some(host) => Some(host.as_str()),
        None if options.auto_rewrite.unwrap_or(false) => {
            req.headers.get(HOST).and_then(|v| v.to_str().ok())
        }
        None => None,
    };
    if let Some(host) = new_host {
        if !set_authority(&mut url, host) {
            debug!("Cannot rewrite redirect host to '{}'", host);
            return false;
        }
    }

    if let Some(protocol) = &options.protocol_rewrite {
        if url.set_scheme(protocol.trim_end_matches(':')).is_err() {
            debug!("Cannot rewrite redirect protocol to '{}'", protocol);
        }
    }

    if let Ok(value) = HeaderValue::from_str(url.as_str()) {
        proxy_res.headers.insert(LOCATION, value);
    }
    false
}

fn set_authority(url: &mut Url, authority: &str) -> bool {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if has_port(authority) => (host, port.parse::<u16>().ok()),
        _ => (authority, None),
    };
    url.set_host(Some(host)).is_ok() && url.set_port(port).is_ok()
}

/// Copies upstream headers onto the response, rewriting cookie attributes.
pub fn write_headers(
    _req: &request::Parts,
    res: &mut response::Parts,
    proxy_res: &mut response::Parts,
    options: &ProxyOptions,
) -> bool {
    let domains = options
        .cookie_domain_rewrite
        .as_ref()
        .map(CookieRewrite::mapping);
    let paths = options.cookie_path_rewrite.as_ref().map(CookieRewrite::mapping);
    let rewrite_cookies = domains.is_some() || paths.is_some();

    for (name, value) in proxy_res.headers.iter() {
        if rewrite_cookies && name == SET_COOKIE {
            continue;
        }
        res.headers.append(name.clone(), value.clone());
    }

    if rewrite_cookies {
        let mut cookies: Vec<String> = proxy_res
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        if let Some(domains) = &domains {
            cookies = rewrite_cookie_properties(&cookies, domains, "domain");
        }
        if let Some(paths) = &paths {
            cookies = rewrite_cookie_properties(&cookies, paths, "path");
        }
        for cookie in cookies {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    res.headers.append(SET_COOKIE, value);
                }
                Err(e) => debug!("Dropping unrepresentable set-cookie value: {}", e),
            }
        }
    }

    if options.preserves_header_key_case() {
        // hyper keeps the received header casing in the response extensions
        res.extensions.extend(proxy_res.extensions.clone());
    }
    false
}

pub fn write_status_code(
    _req: &request::Parts,
    res: &mut response::Parts,
    proxy_res: &mut response::Parts,
    _options: &ProxyOptions,
) -> bool {
    res.status = proxy_res.status;
    if let Some(reason) = proxy_res.extensions.get::<ReasonPhrase>() {
        res.extensions.insert(reason.clone());
    }
    false
}
