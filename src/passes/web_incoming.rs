//! Passes applied to an inbound HTTP request. `stream` is terminal: it
//! forwards the request and stores the response on the exchange.

use super::{WebExchange, WebPass, append_x_forwarded, detach_parts, report_error, web_outgoing};
use crate::common::{ProxyBody, ResponseBuilder, empty_body, full_body};
use crate::error::ProxyError;
use crate::events::ProxyEvent;
use crate::outgoing::OutgoingRequest;
use crate::transport;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, HeaderValue, LOCATION, TRANSFER_ENCODING};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Response, StatusCode};
use log::{debug, warn};
use std::time::Duration;
use tokio::time::Instant;

pub fn passes() -> Vec<(&'static str, WebPass)> {
    vec![
        ("delete_length", delete_length as WebPass),
        ("timeout", timeout as WebPass),
        ("x_headers", x_headers as WebPass),
        ("stream", stream as WebPass),
    ]
}

/// Bodiless DELETE and OPTIONS requests get an explicit zero length so the
/// upstream does not wait for a body.
pub fn delete_length(exchange: &mut WebExchange) -> BoxFuture<'_, bool> {
    let request = &mut exchange.request;
    if (request.method == Method::DELETE || request.method == Method::OPTIONS)
        && !request.headers.contains_key(CONTENT_LENGTH)
    {
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        request.headers.remove(TRANSFER_ENCODING);
    }
    future::ready(false).boxed()
}

pub fn timeout(exchange: &mut WebExchange) -> BoxFuture<'_, bool> {
    if let Some(millis) = exchange.options.timeout {
        exchange.deadline = Some(Instant::now() + Duration::from_millis(millis));
    }
    future::ready(false).boxed()
}

pub fn x_headers(exchange: &mut WebExchange) -> BoxFuture<'_, bool> {
    if exchange.options.xfwd_enabled() {
        let request = &mut exchange.request;
        append_x_forwarded(request, "http", "https");

        if !request.headers.contains_key("x-forwarded-host") {
            if let Some(host) = request.headers.get(HOST).cloned() {
                request.headers.insert("x-forwarded-host", host);
            }
        }
    }
    future::ready(false).boxed()
}

pub fn stream(exchange: &mut WebExchange) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let response = match forward_and_relay(exchange).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Proxying {} {} failed: {}",
                    exchange.request.method, exchange.request.uri, e
                );
                report_error(
                    &exchange.events,
                    exchange.on_error.as_ref(),
                    &e,
                    &exchange.request,
                );
                ResponseBuilder::proxy_error(&e.to_string())
            }
        };
        exchange.response = Some(response);
        true
    })
}

async fn forward_and_relay(exchange: &mut WebExchange) -> Result<Response<ProxyBody>, ProxyError> {
    let mut body = exchange.body.take().unwrap_or_else(empty_body);
    let WebExchange {
        request,
        options,
        events,
        on_error,
        deadline,
        ..
    } = &*exchange;

    if let Some(target) = options.target_location().or(options.forward_location()) {
        events.emit(&mut ProxyEvent::Start { request, target });
    }

    if options.forward_location().is_some() {
        let forward = OutgoingRequest::build(options.ssl.as_ref(), options, request, true)?;
        let forward_body = if options.target_location().is_some() {
            let buffered = body.collect().await?.to_bytes();
            body = full_body(buffered.clone());
            full_body(buffered)
        } else {
            std::mem::replace(&mut body, empty_body())
        };

        let events = events.clone();
        let on_error = on_error.clone();
        let parts = detach_parts(request);
        tokio::spawn(async move {
            let origin = forward.origin();
            match transport::send(forward, forward_body, false).await {
                Ok(response) => debug!("Forward to {} answered {}", origin, response.status()),
                Err(e) => report_error(&events, on_error.as_ref(), &e, &parts),
            }
        });

        if options.target_location().is_none() {
            return Ok(ResponseBuilder::empty(StatusCode::OK));
        }
    }

    let mut outgoing = OutgoingRequest::build(options.ssl.as_ref(), options, request, false)?;
    events.emit(&mut ProxyEvent::ProxyReq {
        outgoing: &mut outgoing,
        request,
        options,
    });

    let limit = [
        options
            .proxy_timeout
            .map(|millis| (Instant::now() + Duration::from_millis(millis), millis)),
        (*deadline).zip(options.timeout),
    ]
    .into_iter()
    .flatten()
    .min_by_key(|(at, _)| *at);

    // Redirects can only be chased when the body can be sent again.
    let mut replay = if options.follows_redirects() {
        let buffered = std::mem::replace(&mut body, empty_body());
        Some(buffered.collect().await?.to_bytes())
    } else {
        None
    };

    let mut origin = outgoing.origin();
    let mut redirects = 0;
    let upstream = loop {
        let hop_body = match &replay {
            Some(bytes) => full_body(bytes.clone()),
            None => std::mem::replace(&mut body, empty_body()),
        };
        let next = replay.is_some().then(|| outgoing.clone());
        let response = send_within(outgoing, hop_body, limit).await?;

        let Some(mut next) = next else { break response };
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|_| FOLLOWED_REDIRECTS.contains(&response.status().as_u16()))
            .map(str::to_string);
        let Some(location) = location else { break response };
        if redirects == options.redirect_limit() {
            return Err(ProxyError::Http(format!(
                "Exceeded {} redirects starting at {}",
                redirects, origin
            )));
        }
        redirects += 1;

        if !next.redirect(response.status(), &location)? {
            replay = Some(Bytes::new());
        }
        debug!(
            "{} redirected {} to {}",
            origin,
            response.status(),
            next.origin()
        );
        origin = next.origin();
        outgoing = next;
    };

    let (mut proxy_res, upstream_body) = upstream.into_parts();
    debug!("{} answered {} for {}", origin, proxy_res.status, request.uri);
    events.emit(&mut ProxyEvent::ProxyRes {
        response: &mut proxy_res,
        request,
    });

    let mut res = Response::new(()).into_parts().0;
    for (name, pass) in web_outgoing::passes() {
        if pass(request, &mut res, &mut proxy_res, options) {
            debug!("Outgoing pass {} handled the response", name);
            break;
        }
    }

    events.emit(&mut ProxyEvent::End {
        request,
        status: res.status,
    });
    Ok(Response::from_parts(res, upstream_body.boxed()))
}

/// Upstream statuses chased when `follow_redirects` is on.
const FOLLOWED_REDIRECTS: [u16; 5] = [301, 302, 303, 307, 308];

async fn send_within(
    outgoing: OutgoingRequest,
    body: ProxyBody,
    limit: Option<(Instant, u64)>,
) -> Result<Response<Incoming>, ProxyError> {
    let origin = outgoing.origin();
    let sent = transport::send(outgoing, body, false);
    match limit {
        Some((at, millis)) => tokio::time::timeout_at(at, sent)
            .await
            .map_err(|_| ProxyError::Timeout {
                target: origin,
                millis,
            })?,
        None => sent.await,
    }
}
