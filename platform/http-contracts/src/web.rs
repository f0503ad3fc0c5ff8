//! axum integration: response rendering, extractors and the request-id layer.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{ApiError, SuccessEnvelope};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const DEFAULT_ACTOR_ROLE: &str = "user";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut res = (status, Json(self.to_envelope())).into_response();
        // lets the request-id layer stamp the id into the body
        res.extensions_mut().insert(self);
        res
    }
}

impl<T: Serialize> IntoResponse for SuccessEnvelope<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Request id assigned by [`request_id_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<RequestId>() {
            return Ok(id.clone());
        }
        Ok(RequestId(
            header_str(&parts.headers, REQUEST_ID_HEADER)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Accept or generate `X-Request-Id`, expose it as [`RequestId`], echo it on
/// the response and into error envelopes.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = header_str(req.headers(), REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut res = stamp_request_id(next.run(req).await, &request_id);
    res.headers_mut().insert(
        REQUEST_ID_HEADER,
        HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    );
    res
}

fn stamp_request_id(res: Response, request_id: &str) -> Response {
    let Some(err) = res
        .extensions()
        .get::<ApiError>()
        .filter(|e| e.request_id.is_none())
        .cloned()
    else {
        return res;
    };

    let err = err.with_request_id(request_id);
    let body = match serde_json::to_vec(&err.to_envelope()) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "failed to re-render error envelope");
            return res;
        }
    };

    let (mut parts, _) = res.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.extensions.insert(err);
    Response::from_parts(parts, Body::from(body))
}

/// Authenticated caller: `Authorization: Bearer <subject>` plus `X-Actor-Role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subject: String,
    pub role: String,
}

impl Actor {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let subject = header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing or malformed bearer token"))?;

        let role = header_str(headers, ACTOR_ROLE_HEADER).unwrap_or(DEFAULT_ACTOR_ROLE);

        Ok(Actor {
            subject: subject.to_string(),
            role: role.to_string(),
        })
    }

    pub fn require_role(&self, role: &str) -> Result<(), ApiError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("role '{role}' required")))
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(actor) = parts.extensions.get::<Actor>() {
            return Ok(actor.clone());
        }
        let actor = Actor::from_headers(&parts.headers)?;
        parts.extensions.insert(actor.clone());
        Ok(actor)
    }
}
