use crate::common::ProxyBody;
use crate::error::ProxyError;
use crate::outgoing::OutgoingRequest;
use base64::{Engine as _, engine::general_purpose};
use http::header::{AUTHORIZATION, HOST, HeaderValue};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};
use std::fmt;
use std::time::Duration;

/// Type alias for the HTTP client used for upstream requests.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Keep-alive probe delay on relay sockets.
const RELAY_KEEPALIVE: Duration = Duration::from_secs(1);

/// A pooled upstream client shared across calls.
///
/// Without an agent every call gets its own connection, which is closed once
/// the exchange is over. Calls that bind a `local_address` or upgrade into a
/// relay also skip the pool.
#[derive(Clone)]
pub struct Agent {
    client: HttpClient,
    max_idle_per_host: usize,
}

impl Agent {
    /// `verify_tls` set to false accepts any upstream certificate on every
    /// pooled connection.
    pub fn new(
        max_idle_per_host: usize,
        idle_timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ProxyError::Tls(format!("Failed to create TLS connector: {}", e)))?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(idle_timeout)
            .http1_preserve_header_case(true)
            .build(HttpsConnector::from((http, tls.into())));

        Ok(Self {
            client,
            max_idle_per_host,
        })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("max_idle_per_host", &self.max_idle_per_host)
            .finish()
    }
}

/// Issues `outgoing` with `body` and waits for the response head.
///
/// `relay` marks connections that will be upgraded into a byte relay; their
/// sockets get Nagle disabled and TCP keep-alive enabled.
pub(crate) async fn send(
    outgoing: OutgoingRequest,
    body: ProxyBody,
    relay: bool,
) -> Result<Response<Incoming>, ProxyError> {
    let origin = outgoing.origin();

    #[cfg(unix)]
    {
        if let Some(socket_path) = outgoing.socket_path.clone() {
            let request = build_request(&outgoing, body, true)?;
            return send_over_unix(&socket_path, request).await;
        }
    }

    let request = build_request(&outgoing, body, false)?;
    debug!("{} {} -> {}", request.method(), request.uri(), origin);

    let client = match pooled(&outgoing, relay) {
        Some(agent) => agent.client().clone(),
        None => {
            if outgoing.agent.is_some() {
                debug!("Bypassing the pool for {}: call needs its own socket", origin);
            }
            unpooled_client(&outgoing, relay)?
        }
    };

    client
        .request(request)
        .await
        .map_err(|e| ProxyError::connection(origin, e))
}

/// The agent to draw a connection from, if the call can share one.
///
/// A bound `local_address` and relay socket tuning are per-connection
/// settings, so those calls get a connection of their own.
fn pooled(outgoing: &OutgoingRequest, relay: bool) -> Option<&Agent> {
    outgoing
        .agent
        .as_ref()
        .filter(|_| !relay && outgoing.local_address.is_none())
}

fn build_request(
    outgoing: &OutgoingRequest,
    body: ProxyBody,
    origin_form: bool,
) -> Result<Request<ProxyBody>, ProxyError> {
    let path = if outgoing.path.starts_with('/') {
        outgoing.path.clone()
    } else {
        format!("/{}", outgoing.path)
    };

    let raw = if origin_form {
        path
    } else {
        let scheme = if outgoing.is_secure() { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, outgoing.connect_host(), outgoing.port, path)
    };
    let uri = raw
        .parse::<Uri>()
        .map_err(|e| ProxyError::Uri(format!("{}: {}", raw, e)))?;

    let mut request = Request::new(body);
    *request.method_mut() = outgoing.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = outgoing.headers.clone();

    let headers = request.headers_mut();
    if let Some(auth) = &outgoing.auth {
        if !headers.contains_key(AUTHORIZATION) {
            let encoded = general_purpose::STANDARD.encode(auth.as_bytes());
            let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                .map_err(|e| ProxyError::Config(format!("Invalid auth header: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
    }
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(outgoing.connect_host()) {
            headers.insert(HOST, value);
        }
    }

    Ok(request)
}

fn unpooled_client(outgoing: &OutgoingRequest, relay: bool) -> Result<HttpClient, ProxyError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_local_address(outgoing.local_address);
    if relay {
        http.set_nodelay(true);
        http.set_keepalive(Some(RELAY_KEEPALIVE));
    }

    let tls = tls_connector(outgoing)?;
    Ok(Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .http1_preserve_header_case(true)
        .build(HttpsConnector::from((http, tls.into()))))
}

/// Builds the upstream TLS connector from the descriptor's TLS material.
fn tls_connector(outgoing: &OutgoingRequest) -> Result<native_tls::TlsConnector, ProxyError> {
    let mut builder = native_tls::TlsConnector::builder();
    if !outgoing.is_secure() {
        return builder
            .build()
            .map_err(|e| ProxyError::Tls(format!("Failed to create TLS connector: {}", e)));
    }

    let tls = &outgoing.tls;

    if outgoing.reject_unauthorized == Some(false) {
        builder.danger_accept_invalid_certs(true);
    }

    for bundle in [tls.ca.as_deref(), outgoing.ca.as_deref()].into_iter().flatten() {
        for pem in split_pem_bundle(bundle) {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("Invalid CA certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }
    }

    if let Some(pfx) = &tls.pfx {
        let der = general_purpose::STANDARD
            .decode(pfx.trim())
            .map_err(|e| ProxyError::Tls(format!("pfx is not valid base64: {}", e)))?;
        let identity =
            native_tls::Identity::from_pkcs12(&der, tls.passphrase.as_deref().unwrap_or(""))
                .map_err(|e| ProxyError::Tls(format!("Invalid pfx identity: {}", e)))?;
        builder.identity(identity);
    } else if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        let identity = native_tls::Identity::from_pkcs8(cert.as_bytes(), key.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Invalid client certificate: {}", e)))?;
        builder.identity(identity);
    }

    if let Some(protocol) = &tls.secure_protocol {
        match min_protocol(protocol) {
            Some(min) => {
                builder.min_protocol_version(Some(min));
            }
            None => warn!("Unknown secure_protocol '{}', using defaults", protocol),
        }
    }

    if tls.ciphers.is_some() {
        warn!("Cipher lists are not supported by the native TLS backend; ignoring");
    }

    builder
        .build()
        .map_err(|e| ProxyError::Tls(format!("Failed to create TLS connector: {}", e)))
}

fn split_pem_bundle(bundle: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    bundle
        .split_inclusive(END)
        .filter(|block| block.contains("-----BEGIN CERTIFICATE-----"))
        .map(|block| block.trim().to_string())
        .collect()
}

fn min_protocol(secure_protocol: &str) -> Option<native_tls::Protocol> {
    let name = secure_protocol.to_ascii_lowercase();
    if name.starts_with("tlsv1_2") || name.starts_with("tls_") || name == "tls" {
        Some(native_tls::Protocol::Tlsv12)
    } else if name.starts_with("tlsv1_1") {
        Some(native_tls::Protocol::Tlsv11)
    } else if name.starts_with("tlsv1") {
        Some(native_tls::Protocol::Tlsv10)
    } else {
        None
    }
}

#[cfg(unix)]
async fn send_over_unix(
    socket_path: &std::path::Path,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, ProxyError> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    let target = format!("unix:{}", socket_path.display());
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ProxyError::connection(target.clone(), e))?;

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::connection(target.clone(), e))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Unix socket upstream connection ended: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::connection(target, e))
}
