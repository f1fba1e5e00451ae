//! API Middleware Service
//!
//! Actix-web middleware that runs API key authorization on every
//! non-public request and records usage telemetry once the response is known.

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage,
};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use super::request::{extract_api_key, extract_client_ip, extract_endpoint, extract_request_id};
use crate::api::headers::{apply_auth_headers, REQUEST_ID};
use crate::auth::RequestAuthorizer;
use crate::config::AuthSettings;
use crate::usage::{RequestOutcome, UsageAggregator};

/// Middleware factory for API authentication, rate limiting and usage tracking
pub struct ApiMiddleware {
    inner: Rc<Inner>,
}

struct Inner {
    authorizer: Arc<RequestAuthorizer>,
    aggregator: Arc<UsageAggregator>,
    creator: String,
    require_apikey: bool,
    /// Paths that don't require authentication
    public_paths: Vec<String>,
}

/// A path is public when it equals a prefix or continues it with a `/`
fn is_public_path(public_paths: &[String], path: &str) -> bool {
    public_paths.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    })
}

impl ApiMiddleware {
    pub fn new(
        authorizer: Arc<RequestAuthorizer>,
        aggregator: Arc<UsageAggregator>,
        settings: &AuthSettings,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                authorizer,
                aggregator,
                creator: settings.creator.clone(),
                require_apikey: settings.require_apikey,
                public_paths: settings.public_paths.clone(),
            }),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Transform = ApiMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ApiMiddlewareService {
            service: Rc::new(service),
            inner: self.inner.clone(),
        })
    }
}

/// The actual middleware service
pub struct ApiMiddlewareService<S> {
    service: Rc<S>,
    inner: Rc<Inner>,
}

impl<S, B> Service<ServiceRequest> for ApiMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut core::task::Context<'_>) -> core::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let inner = self.inner.clone();
        let public = is_public_path(&inner.public_paths, req.path());
        let endpoint = extract_endpoint(&req);

        Box::pin(async move {
            // Skip auth for public paths
            if public {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let start = Instant::now();
            let method = req.method().to_string();
            let address = extract_client_ip(&req);
            let request_id = extract_request_id(&req);
            let api_key = extract_api_key(req.query_string());

            // Authorization switched off: pass through, still count the traffic
            if !inner.require_apikey {
                let mut res = service.call(req).await?;
                let outcome = RequestOutcome::new(
                    &request_id,
                    &endpoint,
                    &method,
                    &address,
                    res.status().as_u16(),
                    start.elapsed().as_millis() as u64,
                )
                .with_key(api_key.as_deref());
                inner.aggregator.record_detached(with_status_error(outcome));
                set_request_id(res.headers_mut(), &request_id);
                return Ok(res.map_into_left_body());
            }

            let auth = match inner
                .authorizer
                .authorize(api_key.as_deref(), &address, &endpoint)
                .await
            {
                Ok(auth) => auth,
                Err(denial) => {
                    let mut response = denial.to_response(&inner.creator);
                    set_request_id(response.headers_mut(), &request_id);
                    let outcome = RequestOutcome::new(
                        &request_id,
                        &endpoint,
                        &method,
                        &address,
                        response.status().as_u16(),
                        start.elapsed().as_millis() as u64,
                    )
                    .with_key(api_key.as_deref())
                    .with_error(denial.kind.code());
                    inner.aggregator.record_detached(outcome);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            // Store auth context in request extensions for handlers
            req.extensions_mut().insert(auth.clone());

            let mut res = service.call(req).await?;

            let outcome = RequestOutcome::new(
                &request_id,
                &endpoint,
                &method,
                &address,
                res.status().as_u16(),
                start.elapsed().as_millis() as u64,
            )
            .with_auth(&auth);
            inner.aggregator.record_detached(with_status_error(outcome));

            let headers = res.headers_mut();
            apply_auth_headers(headers, &auth);
            set_request_id(headers, &request_id);

            Ok(res.map_into_left_body())
        })
    }
}

/// Use the status reason as error text for 4xx/5xx responses
fn with_status_error(outcome: RequestOutcome) -> RequestOutcome {
    if outcome.status_code >= 400 {
        let reason = actix_web::http::StatusCode::from_u16(outcome.status_code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown error");
        outcome.with_error(reason)
    } else {
        outcome
    }
}

fn set_request_id(headers: &mut actix_web::http::header::HeaderMap, request_id: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(REQUEST_ID.as_bytes()),
        HeaderValue::from_str(request_id),
    ) {
        headers.insert(name, value);
    }
}
