use std::sync::Arc;

use actix_web::web::{Data, Query};
use actix_web::{HttpMessage, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::context::ServerContext;
use crate::error::AuthError;
use crate::response::Response;
use crate::session::SessionCredential;

use super::now;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LandingResponse {
    name: &'static str,
    version: &'static str,
    sign_in: String,
    session: &'static str,
}

/// `GET /`
pub async fn landing(ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    Response::json(LandingResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("PORTAL_AUTH_VERSION"),
        sign_in: ctx.cfg.routes.sign_in.clone(),
        session: "/api/session",
    })
    .into()
}

#[derive(Debug, Deserialize)]
pub struct SignInQuery {
    redirect: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignInResponse {
    message: &'static str,
    session: &'static str,
    redirect: String,
}

/// `GET /login`. Describes how to turn an identity token into a session and
/// where to go afterwards.
pub async fn sign_in(query: Query<SignInQuery>, ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    let redirect = match query.into_inner().redirect {
        // Only same-origin paths, never "//host".
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path,
        _ => match ctx.cfg.routes.protected.first() {
            Some(path) => path.clone(),
            None => ctx.cfg.routes.landing.clone(),
        },
    };
    Response::json(SignInResponse {
        message: "Sign in with the identity provider, then POST the identity token to the session endpoint",
        session: "/api/session",
        redirect,
    })
    .into()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    version: &'static str,
    timestamp: u64,
}

/// `GET /healthz`
pub async fn healthz() -> HttpResponse {
    Response::json(HealthResponse {
        version: env!("PORTAL_AUTH_VERSION"),
        timestamp: now(),
    })
    .into()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    path: String,
    uid: String,
    email: String,
    admin: bool,
    expires_at: u64,
}

/// Gated page routes. The gate already decided; this only reports the
/// session it attached.
pub async fn page(req: HttpRequest) -> HttpResponse {
    let credential = req.extensions().get::<SessionCredential>().cloned();
    match credential {
        Some(c) => Response::json(PageResponse {
            path: req.path().to_string(),
            uid: c.uid,
            email: c.email,
            admin: c.admin,
            expires_at: c.expires_at,
        })
        .into(),
        None => Response::error(AuthError::Unauthenticated).into(),
    }
}
