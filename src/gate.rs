use std::sync::Arc;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::LOCATION;
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpMessage, HttpResponse};
use chrono::Utc;
use log::{debug, error};

use crate::error::AuthError;
use crate::response::Response;
use crate::session::{SessionCredential, SessionTokenVerifier};

/// Route classification used by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTable {
    pub landing: String,
    pub sign_in: String,
    /// Where an authenticated non-admin is sent when hitting an admin route
    pub non_admin_landing: String,
    /// Prefixes requiring any authenticated session
    pub protected: Vec<String>,
    /// Prefixes requiring an admin session
    pub admin: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Public,
    Protected,
    Admin,
    /// Not covered by the table, the gate does not apply
    Unclassified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    NonAdmin(SessionCredential),
    Admin(SessionCredential),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow(Option<SessionCredential>),
    Redirect(String),
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

impl RouteTable {
    pub fn classify(&self, path: &str) -> RouteClass {
        if path == self.landing || path == self.sign_in {
            return RouteClass::Public;
        }
        if self.admin.iter().any(|p| matches_prefix(path, p)) {
            return RouteClass::Admin;
        }
        if self.protected.iter().any(|p| matches_prefix(path, p)) {
            return RouteClass::Protected;
        }
        RouteClass::Unclassified
    }

    /// `<sign_in>?redirect=<path>`, escaping the characters that would break
    /// the query string.
    pub fn sign_in_redirect(&self, path: &str) -> String {
        let mut target = String::with_capacity(path.len());
        for c in path.chars() {
            match c {
                '%' => target.push_str("%25"),
                '&' => target.push_str("%26"),
                '+' => target.push_str("%2B"),
                '=' => target.push_str("%3D"),
                '#' => target.push_str("%23"),
                ' ' => target.push_str("%20"),
                c => target.push(c),
            }
        }
        format!("{}?redirect={target}", self.sign_in)
    }
}

/// Per-request authorization from the session cookie alone. Holds nothing
/// but the route table and the verification key, so it can never reach the
/// document store or the identity provider.
pub struct AuthorizationGate {
    routes: RouteTable,
    cookie_name: String,
    verifier: Arc<SessionTokenVerifier>,
}

impl AuthorizationGate {
    pub fn new(routes: RouteTable, cookie_name: String, verifier: Arc<SessionTokenVerifier>) -> Self {
        Self {
            routes,
            cookie_name,
            verifier,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn session_state(&self, cookie: Option<&str>, now: u64) -> SessionState {
        let value = match cookie {
            Some(value) if !value.is_empty() => value,
            _ => return SessionState::Unauthenticated,
        };
        match self.verifier.verify(value, now) {
            Ok(credential) if credential.admin => SessionState::Admin(credential),
            Ok(credential) => SessionState::NonAdmin(credential),
            Err(e) => {
                debug!("Reject session cookie: {e:#}");
                SessionState::Unauthenticated
            }
        }
    }

    pub fn evaluate(&self, path: &str, cookie: Option<&str>, now: u64) -> Verdict {
        let class = self.routes.classify(path);
        if matches!(class, RouteClass::Public | RouteClass::Unclassified) {
            return Verdict::Allow(None);
        }

        match (class, self.session_state(cookie, now)) {
            (_, SessionState::Unauthenticated) => {
                Verdict::Redirect(self.routes.sign_in_redirect(path))
            }
            (RouteClass::Admin, SessionState::NonAdmin(_)) => {
                Verdict::Redirect(self.routes.non_admin_landing.clone())
            }
            (_, SessionState::NonAdmin(c)) | (_, SessionState::Admin(c)) => Verdict::Allow(Some(c)),
        }
    }
}

/// Middleware form of [`AuthorizationGate::evaluate`]. An allowed request
/// carries its [`SessionCredential`] in the request extensions.
pub async fn authorize(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let gate = match req.app_data::<web::Data<AuthorizationGate>>() {
        Some(gate) => gate.clone(),
        None => {
            error!("Authorization gate is not registered, reject {}", req.path());
            let resp = Response::error(AuthError::Internal(String::from(
                "authorization gate missing",
            )));
            return Ok(req.into_response(HttpResponse::from(resp)));
        }
    };

    let cookie = req.cookie(gate.cookie_name());
    let now = Utc::now().timestamp() as u64;
    let verdict = gate.evaluate(req.path(), cookie.as_ref().map(|c| c.value()), now);

    match verdict {
        Verdict::Allow(credential) => {
            if let Some(credential) = credential {
                req.extensions_mut().insert(credential);
            }
            Ok(next.call(req).await?.map_into_boxed_body())
        }
        Verdict::Redirect(location) => {
            debug!("Gate redirect {} -> {location}", req.path());
            let resp = HttpResponse::Found()
                .insert_header((LOCATION, location))
                .finish();
            Ok(req.into_response(resp))
        }
    }
}
