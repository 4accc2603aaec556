//! HTTP front of the edge.
//!
//! `POST /csp-report?key=...` receives browser violation reports. Every
//! other request is proxied to the upstream through the interceptor.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use citadel_edge_networking::{
    handle_error, Destination, ErrorDisposition, ErrorReport, Method, NetworkError, Request,
    RequestMode, Response,
};
use citadel_edge_security::policy::REPORT_KEY_PARAM;
use citadel_edge_security::{parse_report_body, ViolationReport};
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Server, StatusCode};
use url::Url;

use crate::config::REPORT_PATH;
use crate::context::EdgeContext;

/// Response headers that describe the upstream connection rather than the
/// resource.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "trailer",
    "content-length",
];

/// Serve until `shutdown` resolves.
pub async fn serve<F>(ctx: Arc<EdgeContext>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let addr = ctx.config().listen;
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        log::trace!("Accepted connection remote={}", conn.remote_addr());
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&ctx), req))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("binding {}", addr))?
        .serve(make_svc);
    log::info!("Listening addr={}", server.local_addr());

    server
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving requests")?;
    log::info!("Server stopped");
    Ok(())
}

/// Route one request.
pub async fn handle(
    ctx: Arc<EdgeContext>,
    req: hyper::Request<Body>,
) -> Result<hyper::Response<Body>, Infallible> {
    let response = if req.uri().path() == REPORT_PATH {
        receive_report(&ctx, req).await
    } else {
        proxy(&ctx, req).await
    };
    Ok(response)
}

async fn receive_report(ctx: &EdgeContext, req: hyper::Request<Body>) -> hyper::Response<Body> {
    if req.method() != hyper::Method::POST {
        let mut response = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let key = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == REPORT_KEY_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    let authorized = key
        .as_deref()
        .map(|key| ctx.keys().verify_reference(key))
        .unwrap_or(false);
    if !authorized {
        log::warn!("Rejected violation report with unknown key");
        return plain(StatusCode::FORBIDDEN, "invalid report key");
    }

    let limit = ctx.config().violations.max_report_bytes;
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.map_or(false, |len| len > limit) {
        return plain(StatusCode::PAYLOAD_TOO_LARGE, "report too large");
    }

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            log::debug!("Failed to read report body: {}", e);
            return plain(StatusCode::BAD_REQUEST, "unreadable body");
        }
    };
    if body.len() > limit {
        return plain(StatusCode::PAYLOAD_TOO_LARGE, "report too large");
    }

    let event = match parse_report_body(&body) {
        Ok(event) => event,
        Err(e) => {
            log::debug!("Malformed violation report: {}", e);
            return plain(StatusCode::BAD_REQUEST, "malformed report");
        }
    };

    if handle_error(&ErrorReport::from_violation(event.clone())) == ErrorDisposition::Discarded {
        return no_content();
    }

    let report = ViolationReport::from_event(
        &event,
        &user_agent,
        Some(ctx.client_id().to_string()),
        chrono::Utc::now(),
    );
    match ctx.collector().report_violation(report).await {
        Ok(id) => log::debug!("Recorded violation id={}", id),
        // Already buffered for replay by the collector.
        Err(e) => log::warn!("Violation store unavailable, report buffered error={}", e),
    }
    no_content()
}

async fn proxy(ctx: &EdgeContext, req: hyper::Request<Body>) -> hyper::Response<Body> {
    let (parts, body) = req.into_parts();

    let Some(url) = upstream_url(&ctx.config().upstream, &parts.uri) else {
        log::warn!("Rejected off-origin request target={}", parts.uri);
        return plain(StatusCode::BAD_REQUEST, "bad request path");
    };

    let method: Method = match parts.method.as_str().parse() {
        Ok(method) => method,
        Err(_) => return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            log::debug!("Failed to read request body url={} error={}", url, e);
            return plain(StatusCode::BAD_REQUEST, "unreadable body");
        }
    };

    let mut request = Request::from_url(method, url);
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    let (destination, mode) = fetch_metadata(&parts.headers);
    request = request.with_destination(destination).with_mode(mode);
    if !body.is_empty() {
        request = request.with_body(body);
    }

    match ctx.interceptor().handle(request).await {
        Ok(response) => to_hyper(response),
        Err(NetworkError::PolicyAssembly(e)) => {
            log::error!("Refusing to serve navigation without a policy: {}", e);
            plain(StatusCode::SERVICE_UNAVAILABLE, "security policy unavailable")
        }
        Err(e) => plain(StatusCode::BAD_GATEWAY, &format!("upstream error: {}", e)),
    }
}

/// The upstream URL for a request target.
///
/// Only the path and query are taken from the request; scheme, host and
/// port always come from the upstream. `None` for targets that would leave
/// the upstream origin.
fn upstream_url(upstream: &Url, uri: &hyper::Uri) -> Option<Url> {
    let path = uri.path();
    if !path.starts_with('/') || path.starts_with("//") {
        return None;
    }
    let mut url = upstream.clone();
    url.set_path(path);
    url.set_query(uri.query());
    (url.origin() == upstream.origin()).then_some(url)
}

/// Destination and mode from the fetch metadata headers.
///
/// Clients that send none are treated as navigating when they accept HTML.
fn fetch_metadata(headers: &hyper::HeaderMap) -> (Destination, RequestMode) {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    match (header("sec-fetch-dest"), header("sec-fetch-mode")) {
        (None, None) => {
            let wants_html = header("accept").map_or(false, |accept| accept.contains("text/html"));
            if wants_html {
                (Destination::Document, RequestMode::Navigate)
            } else {
                (Destination::Empty, RequestMode::NoCors)
            }
        }
        (dest, mode) => (
            dest.map(Destination::from_header).unwrap_or(Destination::Empty),
            mode.map(RequestMode::from_header).unwrap_or(RequestMode::NoCors),
        ),
    }
}

fn to_hyper(response: Response) -> hyper::Response<Body> {
    let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut out = hyper::Response::new(Body::from(response.body().clone()));
    *out.status_mut() = status;
    for (name, value) in response.header_pairs() {
        if HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => log::debug!("Dropping invalid response header name={}", name),
        }
    }
    out
}

fn plain(status: StatusCode, message: &str) -> hyper::Response<Body> {
    let mut response = hyper::Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn no_content() -> hyper::Response<Body> {
    let mut response = hyper::Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}
