use std::sync::Arc;

use actix_web::web::{Bytes, Data};
use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};

use crate::context::ServerContext;
use crate::error::AuthError;
use crate::response::Response;
use crate::session::MintedSession;

use super::{now, parse_body};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdTokenRequest {
    #[serde(default)]
    id_token: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    message: String,
    uid: String,
}

fn id_token_of(body: &Bytes) -> Result<String, AuthError> {
    let req: IdTokenRequest = parse_body(body)
        .map_err(|_| AuthError::InvalidToken(String::from("malformed session request")))?;
    Ok(req.id_token)
}

fn session_response(session: MintedSession, message: &str) -> HttpResponse {
    let data = SessionResponse {
        message: String::from(message),
        uid: session.credential.uid,
    };
    Response::with_cookie(data, session.cookie).into()
}

/// `POST /api/session`
pub async fn mint(body: Bytes, ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    let id_token = match id_token_of(&body) {
        Ok(token) => token,
        Err(e) => return Response::error(e).into(),
    };
    match ctx.sessions.mint(&id_token, now()).await {
        Ok(session) => session_response(session, "Session created"),
        Err(e) => Response::error(e).into(),
    }
}

/// `POST /api/session/refresh`
pub async fn refresh(body: Bytes, ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    let id_token = match id_token_of(&body) {
        Ok(token) => token,
        Err(e) => return Response::error(e).into(),
    };
    match ctx.sessions.refresh(&id_token, now()).await {
        Ok(session) => session_response(session, "Session refreshed"),
        Err(e) => Response::error(e).into(),
    }
}

/// `POST /api/session/logout`
pub async fn logout(ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    #[derive(Serialize)]
    struct LogoutResponse {
        message: &'static str,
    }

    Response::with_cookie(
        LogoutResponse {
            message: "Logged out",
        },
        ctx.sessions.revoke(),
    )
    .into()
}
