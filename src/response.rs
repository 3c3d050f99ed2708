use actix_web::cookie::Cookie;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder};
use log::{debug, error};
use serde::Serialize;

use crate::error::AuthError;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: &'static str,
    pub message: String,
}

/// Body of responses that only carry a message.
#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub message: String,
}

/// A wrapper for HTTP responses with constructors for the shapes the API
/// returns.
pub struct Response {
    http_response: HttpResponse,
}

impl Response {
    pub fn json<T: Serialize>(data: T) -> Self {
        Self {
            http_response: HttpResponse::Ok().json(data),
        }
    }

    pub fn message(message: impl ToString) -> Self {
        Self::json(MessageBody {
            message: message.to_string(),
        })
    }

    /// JSON body plus a `Set-Cookie` header.
    pub fn with_cookie<T: Serialize>(data: T, cookie: Cookie<'static>) -> Self {
        Self {
            http_response: HttpResponse::Ok().cookie(cookie).json(data),
        }
    }

    pub fn not_found(method: &str, path: &str) -> Self {
        debug!("No route to {method} {path}");
        Self::err_response(
            StatusCode::NOT_FOUND,
            "not-found",
            format!("No route to {method} {path}"),
        )
    }

    /// Maps an [`AuthError`] to its status and public message. The detail
    /// only goes to the log.
    pub fn error(err: AuthError) -> Self {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {err}");
        } else {
            debug!("Request rejected: {err}");
        }
        Self::err_response(status, err.code(), err.public_message())
    }

    fn err_response(status: StatusCode, error: &'static str, message: String) -> Self {
        let body = ErrorBody {
            code: status.as_u16(),
            error,
            message,
        };
        Self {
            http_response: HttpResponseBuilder::new(status).json(body),
        }
    }
}

impl From<AuthError> for Response {
    fn from(err: AuthError) -> Self {
        Self::error(err)
    }
}

impl From<Response> for HttpResponse {
    fn from(val: Response) -> Self {
        val.http_response
    }
}
