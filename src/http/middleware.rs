//! Enforcement middleware: the gate every protected route passes through.
//!
//! For each request, in order:
//! 1. rate limit (if the route has a policy); a denial returns 429 and the
//!    handler never runs,
//! 2. authentication (if required); a failure returns 401,
//! 3. the handler, with faults and panics turned into an opaque 500.
//!
//! Rate limiting runs before authentication so that requests with bad
//! credentials are still throttled.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Json;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use super::auth::Authenticator;
use crate::clock::Clock;
use crate::ratelimit::{ClientIdentifier, Policy, RateLimitBackend, RateLimitResult};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("rate-limit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("rate-limit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("rate-limit-reset");

const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests, please try again later.";
const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// What a wrapped route requires of each request.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateOptions {
    pub require_auth: bool,
    pub rate_limit: Option<Policy>,
}

impl GateOptions {
    /// Rate limit under `policy`, no authentication.
    pub fn rate_limited(policy: Policy) -> Self {
        Self {
            require_auth: false,
            rate_limit: Some(policy),
        }
    }

    /// Authentication only.
    pub fn authenticated() -> Self {
        Self {
            require_auth: true,
            rate_limit: None,
        }
    }

    /// Also require authentication.
    pub fn with_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }
}

/// Shared collaborators for every gated route.
///
/// One backend is chosen at start-up and used for every route.
#[derive(Clone)]
pub struct Gate {
    backend: Arc<dyn RateLimitBackend>,
    authenticator: Arc<dyn Authenticator>,
    clock: Arc<dyn Clock>,
}

impl Gate {
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        authenticator: Arc<dyn Authenticator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            authenticator,
            clock,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RateLimitBackend> {
        &self.backend
    }

    /// Put `route` behind the gate.
    ///
    /// Only methods the route handles pass through the gate; a 405 for any
    /// other method costs no quota.
    pub fn wrap<S>(&self, route: MethodRouter<S>, options: GateOptions) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let layer = GateLayer {
            gate: self.clone(),
            options,
        };
        route.route_layer(middleware::from_fn_with_state(layer, enforce))
    }
}

#[derive(Clone)]
struct GateLayer {
    gate: Gate,
    options: GateOptions,
}

/// Marker left on a response by [`HandlerFault`] so the gate can log it.
#[derive(Clone, Debug)]
struct FaultDetail(Arc<str>);

/// An error escaping a wrapped handler.
///
/// Renders as an opaque 500. The detail is only ever written to the server
/// log, by the gate.
#[derive(Debug)]
pub struct HandlerFault(anyhow::Error);

impl<E> From<E> for HandlerFault
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for HandlerFault {
    fn into_response(self) -> Response {
        let mut response = internal_error();
        response
            .extensions_mut()
            .insert(FaultDetail(format!("{:#}", self.0).into()));
        response
    }
}

async fn enforce(State(layer): State<GateLayer>, request: Request, next: Next) -> Response {
    let client = ClientIdentifier::from_headers(request.headers());
    let policy = layer.options.rate_limit.map(|p| p.name()).unwrap_or("none");
    let span = info_span!(
        "gate",
        request_id = %Uuid::new_v4(),
        client = %client,
        policy = policy,
        method = %request.method(),
        path = %request.uri().path(),
    );

    run_gate(layer, client, request, next).instrument(span).await
}

async fn run_gate(
    layer: GateLayer,
    client: ClientIdentifier,
    mut request: Request,
    next: Next,
) -> Response {
    let GateLayer { gate, options } = layer;

    let decision = match options.rate_limit {
        Some(policy) => {
            let result = gate.backend.check(&client.scoped(policy.name()), &policy).await;
            if !result.allowed {
                let retry_after = result.retry_after_secs(gate.clock.now_ms());
                warn!(retry_after_secs = retry_after, "Request rate limited");
                return too_many_requests(&result, retry_after);
            }
            Some(result)
        }
        None => None,
    };

    if options.require_auth {
        match gate.authenticator.authenticate(request.headers()).await {
            Some(principal) => {
                debug!(subject = %principal.subject, "Request authenticated");
                request.extensions_mut().insert(principal);
            }
            None => {
                debug!("Request rejected: not authenticated");
                let mut response = unauthorized();
                if let Some(result) = &decision {
                    apply_rate_limit_headers(&mut response, result);
                }
                return response;
            }
        }
    }

    let mut response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => match response.extensions().get::<FaultDetail>() {
            Some(FaultDetail(detail)) => {
                error!(error = %detail, "Handler failed");
                internal_error()
            }
            None => response,
        },
        Err(panic) => {
            error!(panic = %panic_message(&*panic), "Handler panicked");
            internal_error()
        }
    };

    if let Some(result) = &decision {
        apply_rate_limit_headers(&mut response, result);
    }
    response
}

fn apply_rate_limit_headers(response: &mut Response, result: &RateLimitResult) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(
        RATE_LIMIT_REMAINING,
        HeaderValue::from(result.remaining.min(result.limit)),
    );
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(result.reset_secs()));
}

fn too_many_requests(result: &RateLimitResult, retry_after: u64) -> Response {
    let body = json!({
        "status": false,
        "message": TOO_MANY_REQUESTS_MESSAGE,
        "retryAfter": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_rate_limit_headers(
        &mut response,
        &RateLimitResult {
            remaining: 0,
            ..*result
        },
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn unauthorized() -> Response {
    let body = json!({ "status": false, "message": UNAUTHORIZED_MESSAGE });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn internal_error() -> Response {
    let body = json!({ "status": false, "message": INTERNAL_ERROR_MESSAGE });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
