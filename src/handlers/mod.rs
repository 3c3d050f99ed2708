use actix_web::web::Bytes;
use actix_web::{HttpMessage, HttpRequest};
use chrono::Utc;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::ServerContext;
use crate::error::{AuthError, AuthResult};
use crate::session::SessionCredential;

pub mod admin;
pub mod pages;
pub mod projects;
pub mod session;

/// Resolves the caller's session or returns the JSON error response from
/// the enclosing handler. API routes never redirect.
#[macro_export]
macro_rules! session_request {
    ($ctx:expr, $req:expr) => {
        match $crate::handlers::session_of($ctx, &$req) {
            Ok(credential) => credential,
            Err(e) => return $crate::response::Response::error(e).into(),
        }
    };
}

/// Like [`session_request!`], additionally requiring the admin claim.
#[macro_export]
macro_rules! admin_request {
    ($ctx:expr, $req:expr) => {{
        let credential = $crate::session_request!($ctx, $req);
        if !credential.admin {
            return $crate::response::Response::error($crate::error::AuthError::PermissionDenied)
                .into();
        }
        credential
    }};
}

pub fn session_of(ctx: &ServerContext, req: &HttpRequest) -> AuthResult<SessionCredential> {
    let cookie = match req.cookie(&ctx.cfg.session.cookie_name) {
        Some(cookie) if !cookie.value().is_empty() => cookie,
        _ => return Err(AuthError::Unauthenticated),
    };
    match ctx.sessions.verify(cookie.value(), now()) {
        Ok(credential) => Ok(credential),
        Err(e) => {
            debug!("Reject session of {}: {e}", req.path());
            Err(AuthError::Unauthenticated)
        }
    }
}

pub fn now() -> u64 {
    Utc::now().timestamp() as u64
}

/// Decodes a JSON body; an empty body yields the default value.
pub fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> AuthResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AuthError::InvalidArgument(format!("invalid request body: {e}")))
}

/// A stored record together with its document id.
#[derive(Debug, Serialize)]
pub struct Item<T: Serialize> {
    pub id: String,

    #[serde(flatten)]
    pub data: T,
}
