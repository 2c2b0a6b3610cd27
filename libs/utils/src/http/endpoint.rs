use std::future::Future;

use anyhow::Context;
use hyper::{Body, Request, Response};
use routerify::ext::RequestExt;
use routerify::{Middleware, RequestInfo, Router, RouterBuilder, RouterService};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use super::error::{route_error_handler, ApiError};

/// Cheap process-unique request id for log correlation. Not a UUID on
/// purpose: the access-log request ids come from the static server and
/// these only need to be distinguishable within one control-plane log.
fn next_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Adds a tracing info_span! instrumentation around the handler events,
/// logs the request start and end events for requests.
///
/// Usage: Replace `my_handler` with `|r| request_span(r, my_handler)`
///
/// Use this to distinguish between logs of different HTTP requests: every
/// request handler wrapped with this will get request info logged in the span,
/// including the unique request id.
pub async fn request_span<R, H>(request: Request<Body>, handler: H) -> R::Output
where
    R: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
    H: FnOnce(Request<Body>) -> R + Send + Sync + 'static,
{
    let request_id = request
        .context::<RequestId>()
        .map(|id| id.0)
        .unwrap_or_default();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_span = info_span!("request", %method, %path, %request_id);

    async move {
        let cancellation_guard = RequestCancelled::warn_when_dropped_without_responding();
        info!("Handling request");
        let res = handler(request).await;
        cancellation_guard.disarm();
        res
    }
    .instrument(request_span)
    .await
}

/// Drop guard to WARN in case the request was dropped before completion.
struct RequestCancelled {
    warn: Option<tracing::Span>,
}

impl RequestCancelled {
    /// Create the drop guard using the [`tracing::Span::current`] as the span.
    fn warn_when_dropped_without_responding() -> Self {
        RequestCancelled {
            warn: Some(tracing::Span::current()),
        }
    }

    /// Consume the drop guard without logging anything.
    fn disarm(mut self) {
        self.warn = None;
    }
}

impl Drop for RequestCancelled {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // we are unwinding due to panicking, assume we are not dropped for cancellation
        } else if let Some(span) = self.warn.take() {
            // the span has all of the info already, but the outer `.instrument(span)` has already
            // been dropped, so we need to manually re-enter it for this message.
            let _g = span.entered();
            tracing::warn!("request was dropped before completing");
        }
    }
}

#[derive(Clone, Default)]
struct RequestId(String);

/// Adds a unique request id to each incoming request for correlation, and
/// logs it together with the response status when the response goes out.
fn add_request_id_middleware() -> Middleware<Body, ApiError> {
    Middleware::pre(move |req| async move {
        req.set_context(RequestId(next_request_id()));
        Ok(req)
    })
}

async fn add_request_id_header_to_response(
    mut res: Response<Body>,
    req_info: RequestInfo,
) -> Result<Response<Body>, ApiError> {
    if let Some(request_id) = req_info.context::<RequestId>() {
        if let Ok(request_header_value) = request_id.0.parse() {
            res.headers_mut()
                .insert("x-request-id", request_header_value);
        }
    }

    Ok(res)
}

pub fn make_router() -> RouterBuilder<hyper::Body, ApiError> {
    Router::builder()
        .middleware(add_request_id_middleware())
        .middleware(Middleware::post_with_info(
            add_request_id_header_to_response,
        ))
        .err_handler(route_error_handler)
}

/// Serve the router on an already-bound listener until the cancellation
/// token fires, then finish in-flight requests and return.
pub async fn serve(
    router_builder: RouterBuilder<hyper::Body, ApiError>,
    listener: std::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let router = router_builder
        .build()
        .map_err(|err| anyhow::anyhow!("failed to build HTTP router: {err}"))?;
    let service = RouterService::new(router)
        .map_err(|err| anyhow::anyhow!("failed to build HTTP service: {err}"))?;

    listener
        .set_nonblocking(true)
        .context("set nonblocking on HTTP listener")?;
    let server = hyper::Server::from_tcp(listener)
        .context("building HTTP server")?
        .serve(service)
        .with_graceful_shutdown(async move { cancel.cancelled().await });

    server.await.context("serving HTTP")
}
