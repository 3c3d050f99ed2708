mod local;
mod retry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AuthResult;

pub use local::LocalIdentityProvider;
pub use retry::call_with_retry;

/// Custom claims attached by the provider to every token it issues.
pub type Claims = serde_json::Map<String, Value>;

pub const ADMIN_CLAIM: &str = "admin";

/// Only a literal `true` counts; a missing key, `false` or any other value
/// is non-admin.
pub fn is_admin_claim(claims: &Claims) -> bool {
    matches!(claims.get(ADMIN_CLAIM), Some(Value::Bool(true)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub uid: String,
    pub email: String,
    pub claims: Claims,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        is_admin_claim(&self.claims)
    }
}

/// The verified content of an identity token.
#[derive(Debug, Clone, PartialEq)]
pub struct IdToken {
    pub uid: String,
    pub email: String,
    /// Admin claim as of the moment the token was issued.
    pub admin: bool,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// The credential/identity authority. Implementations are shared behind an
/// `Arc<dyn IdentityProvider>` handed to each component at construction.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Checks signature, issuer and lifetime of a raw identity token.
    async fn verify_id_token(&self, token: &str, now: u64) -> AuthResult<IdToken>;

    async fn get_user(&self, uid: &str) -> AuthResult<Principal>;

    async fn get_user_by_email(&self, email: &str) -> AuthResult<Principal>;

    /// Replaces the principal's whole claims map. Callers wanting merge
    /// semantics pass the merged map.
    async fn set_custom_claims(&self, uid: &str, claims: Claims) -> AuthResult<()>;
}
