use std::sync::Arc;

use actix_web::web::{Bytes, Data, Path};
use actix_web::{HttpRequest, HttpResponse};
use log::info;
use serde::{Deserialize, Serialize};

use crate::admin_request;
use crate::context::ServerContext;
use crate::error::AuthError;
use crate::model::Role;
use crate::response::Response;
use crate::store::Records;

use super::parse_body;

#[derive(Debug, Default, Deserialize)]
struct GrantRequest {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Serialize)]
struct GrantResponse {
    message: String,
    uid: String,
}

/// `POST /api/admin/grant`
pub async fn grant(req: HttpRequest, body: Bytes, ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    let op = admin_request!(&ctx, req);
    let body: GrantRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return Response::error(e).into(),
    };

    match ctx.claims.grant_admin(&body.email).await {
        Ok(uid) => {
            info!("{} granted admin to {uid}", op.email);
            Response::json(GrantResponse {
                message: format!("{} has been made an admin", body.email.trim()),
                uid,
            })
            .into()
        }
        Err(e) => Response::error(e).into(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RoleRequest {
    #[serde(default)]
    role: String,
}

/// `PUT /api/users/{uid}/role`. Only the desired role is written; the claim
/// follows through the role document trigger.
pub async fn set_role(
    req: HttpRequest,
    uid: Path<String>,
    body: Bytes,
    ctx: Data<Arc<ServerContext>>,
) -> HttpResponse {
    let op = admin_request!(&ctx, req);
    let body: RoleRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return Response::error(e).into(),
    };
    let role: Role = match body.role.parse() {
        Ok(role) => role,
        Err(e) => return Response::error(AuthError::InvalidArgument(format!("{e:#}"))).into(),
    };

    let uid = uid.into_inner();
    if let Err(e) = ctx.store.set_role(&uid, role) {
        return Response::error(AuthError::store(e)).into();
    }
    info!("{} set role of {uid} to {role}", op.email);
    Response::message(format!("Role of {uid} set to {role}")).into()
}
