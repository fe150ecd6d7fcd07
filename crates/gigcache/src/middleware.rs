use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::cache::CallerIdentity;

/// Header carrying the authenticated user id, set by a trusted gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user's role, set by a trusted gateway.
pub const USER_ROLE_HEADER: &str = "x-user-role";

// Middleware that ensures each request has an X-Request-Id and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // Preserve an incoming request id; otherwise generate one
    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// Lift the caller identity out of gateway headers into request extensions.
///
/// Only for deployments where an authenticating proxy sets (and strips
/// client-supplied) `x-user-id` / `x-user-role`. An identity already placed
/// in extensions by an in-process auth layer wins.
pub async fn caller_identity_from_headers(mut req: Request<Body>, next: Next) -> Response {
    if req.extensions().get::<CallerIdentity>().is_none() {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let identity = CallerIdentity {
            user_id: header(USER_ID_HEADER),
            role: header(USER_ROLE_HEADER),
        };
        req.extensions_mut().insert(identity);
    }
    next.run(req).await
}
