use std::sync::Arc;

use actix_web::web::{Bytes, Data, Path};
use actix_web::{HttpRequest, HttpResponse};
use log::info;
use serde::{Deserialize, Serialize};

use crate::approval;
use crate::context::ServerContext;
use crate::error::{AuthError, AuthResult};
use crate::model::{FileRecord, Project, PROJECTS};
use crate::response::Response;
use crate::session::SessionCredential;
use crate::store::{object, Records};
use crate::{admin_request, session_request};

use super::{now, parse_body, Item};

pub const HEADER_FILE_NAME: &str = "X-File-Name";

/// Folder of uploads made by clients; admin uploads go under `projects/`.
const CLIENT_UPLOADS: &str = "client_uploads";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    client_email: String,
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    id: String,
}

/// `POST /api/projects`
pub async fn create_project(
    req: HttpRequest,
    body: Bytes,
    ctx: Data<Arc<ServerContext>>,
) -> HttpResponse {
    let op = admin_request!(&ctx, req);
    let body: CreateProjectRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return Response::error(e).into(),
    };

    let name = body.name.trim();
    let client_email = body.client_email.trim();
    if name.is_empty() || client_email.is_empty() {
        return Response::error(AuthError::InvalidArgument(String::from(
            "name and clientEmail are required",
        )))
        .into();
    }

    let project = Project {
        id: String::new(),
        name: name.to_string(),
        client_email: client_email.to_string(),
        status: String::from("active"),
        created_at: now(),
        updated_at: None,
        created_by: Some(op.email.clone()),
    };
    match ctx.store.create_project(&project) {
        Ok(id) => {
            info!("{} created project {id} for {client_email}", op.email);
            Response::json(CreatedResponse { id }).into()
        }
        Err(e) => Response::error(AuthError::store(e)).into(),
    }
}

/// `GET /api/projects`. Admins see every project, clients only their own.
pub async fn list_projects(req: HttpRequest, ctx: Data<Arc<ServerContext>>) -> HttpResponse {
    let op = session_request!(&ctx, req);
    let filter = if op.admin {
        None
    } else {
        Some(op.email.as_str())
    };
    match ctx.store.list_projects(filter) {
        Ok(projects) => Response::json(
            projects
                .into_iter()
                .map(|p| Item {
                    id: p.id.clone(),
                    data: p,
                })
                .collect::<Vec<_>>(),
        )
        .into(),
        Err(e) => Response::error(AuthError::store(e)).into(),
    }
}

/// Loads the project if `op` may see it: admins always, clients only when
/// they are the project's client.
fn accessible_project(ctx: &ServerContext, op: &SessionCredential, id: &str) -> AuthResult<Project> {
    let project = ctx
        .store
        .get_project(id)
        .map_err(AuthError::store)?
        .ok_or_else(|| AuthError::NotFound(format!("{PROJECTS}/{id}")))?;
    if !op.admin && project.client_email != op.email {
        return Err(AuthError::PermissionDenied);
    }
    Ok(project)
}

/// `GET /api/projects/{pid}/files`, newest upload first.
pub async fn list_files(
    req: HttpRequest,
    pid: Path<String>,
    ctx: Data<Arc<ServerContext>>,
) -> HttpResponse {
    let op = session_request!(&ctx, req);
    let result = accessible_project(&ctx, &op, &pid)
        .and_then(|_| ctx.store.list_files(&pid).map_err(AuthError::store));
    match result {
        Ok(files) => Response::json(
            files
                .into_iter()
                .map(|f| Item {
                    id: f.id.clone(),
                    data: f,
                })
                .collect::<Vec<_>>(),
        )
        .into(),
        Err(e) => Response::error(e).into(),
    }
}

/// Last path component of a client supplied file name.
fn sanitize_file_name(name: &str) -> Option<&str> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

/// `POST /api/projects/{pid}/files`. The raw body is the file content, its
/// name comes from the `X-File-Name` header. Every upload starts pending.
pub async fn upload_file(
    req: HttpRequest,
    pid: Path<String>,
    body: Bytes,
    ctx: Data<Arc<ServerContext>>,
) -> HttpResponse {
    let op = session_request!(&ctx, req);
    match upload(&ctx, &op, &req, &pid, &body) {
        Ok(file) => Response::json(Item {
            id: file.id.clone(),
            data: file,
        })
        .into(),
        Err(e) => Response::error(e).into(),
    }
}

fn upload(
    ctx: &ServerContext,
    op: &SessionCredential,
    req: &HttpRequest,
    pid: &str,
    body: &Bytes,
) -> AuthResult<FileRecord> {
    accessible_project(ctx, op, pid)?;

    let name = req
        .headers()
        .get(HEADER_FILE_NAME)
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_file_name)
        .ok_or_else(|| {
            AuthError::InvalidArgument(format!("header {HEADER_FILE_NAME} is required"))
        })?;

    let folder = if op.admin { PROJECTS } else { CLIENT_UPLOADS };
    let key = format!("{folder}/{pid}/{name}");
    object::validate_key(&key).map_err(|e| AuthError::InvalidArgument(format!("{e:#}")))?;
    let url = ctx.objects.put(&key, body).map_err(AuthError::store)?;

    let mut file = FileRecord::new_upload(
        name.to_string(),
        url,
        body.len() as u64,
        op.email.clone(),
        now(),
    );
    file.id = ctx.store.create_file(pid, &file).map_err(AuthError::store)?;
    info!("{} uploaded {key} ({} bytes)", op.email, file.size);
    Ok(file)
}

/// `POST /api/projects/{pid}/files/{fid}/toggle`
pub async fn toggle_file(
    req: HttpRequest,
    path: Path<(String, String)>,
    ctx: Data<Arc<ServerContext>>,
) -> HttpResponse {
    let op = admin_request!(&ctx, req);
    let (pid, fid) = path.into_inner();
    match approval::toggle_approval(ctx.store.as_ref(), &pid, &fid, &op.email, now()) {
        Ok(file) => Response::json(Item {
            id: file.id.clone(),
            data: file,
        })
        .into(),
        Err(e) => Response::error(e).into(),
    }
}
