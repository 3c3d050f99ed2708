mod cookie;
mod jwt;

use std::sync::Arc;
use std::time::Duration;

use actix_web::cookie::Cookie;
use log::{info, warn};

use crate::error::{AuthError, AuthResult};
use crate::identity::{call_with_retry, IdToken, IdentityProvider};
use crate::store::{DocumentStore, Records};

pub use cookie::CookiePolicy;
pub use jwt::{SessionTokenSigner, SessionTokenVerifier};

/// Decoded content of a session cookie.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredential {
    pub uid: String,
    pub email: String,
    /// Admin claim as carried by the identity token the credential was
    /// minted from. Not updated until the next Refresh.
    pub admin: bool,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// A freshly minted credential together with the cookie carrying it.
pub struct MintedSession {
    pub credential: SessionCredential,
    pub cookie: Cookie<'static>,
}

/// Converts identity tokens into session cookies and back. The server keeps
/// no session table; a credential is valid until its own expiry.
pub struct SessionLifecycleManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,

    signer: SessionTokenSigner,
    verifier: Arc<SessionTokenVerifier>,
    policy: CookiePolicy,

    timeout: Duration,
}

impl SessionLifecycleManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        signer: SessionTokenSigner,
        verifier: Arc<SessionTokenVerifier>,
        policy: CookiePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            signer,
            verifier,
            policy,
            timeout,
        }
    }

    /// Verifies `id_token` with the provider and mints a session cookie.
    /// Also records the login in the principal's role document; that write
    /// is best-effort and never fails the mint.
    pub async fn mint(&self, id_token: &str, now: u64) -> AuthResult<MintedSession> {
        let identity = self.verify_identity(id_token, now).await?;
        let session = self.issue(&identity, now)?;

        match self.store.upsert_login(&identity.uid, &identity.email, now) {
            Ok(true) => info!("First login of {}, created role document", identity.uid),
            Ok(false) => {}
            Err(e) => warn!("Record login of {} failed: {e:#}", identity.uid),
        }

        info!(
            "Minted session for {} (admin: {})",
            identity.uid, session.credential.admin
        );
        Ok(session)
    }

    /// Re-verifies a rotated identity token and overwrites the cookie. The
    /// only path by which a changed claim reaches the gate.
    pub async fn refresh(&self, id_token: &str, now: u64) -> AuthResult<MintedSession> {
        let identity = self.verify_identity(id_token, now).await?;
        let session = self.issue(&identity, now)?;
        info!(
            "Refreshed session for {} (admin: {})",
            identity.uid, session.credential.admin
        );
        Ok(session)
    }

    /// Cookie that erases the session on the client.
    pub fn revoke(&self) -> Cookie<'static> {
        self.policy.clear()
    }

    /// Local verification of a cookie value.
    pub fn verify(&self, value: &str, now: u64) -> AuthResult<SessionCredential> {
        self.verifier
            .verify(value, now)
            .map_err(|e| AuthError::InvalidToken(format!("{e:#}")))
    }

    async fn verify_identity(&self, id_token: &str, now: u64) -> AuthResult<IdToken> {
        let id_token = id_token.trim();
        if id_token.is_empty() {
            return Err(AuthError::InvalidToken(String::from("missing identity token")));
        }
        call_with_retry(self.timeout, || self.provider.verify_id_token(id_token, now)).await
    }

    fn issue(&self, identity: &IdToken, now: u64) -> AuthResult<MintedSession> {
        let (token, credential) = self
            .signer
            .sign(&identity.uid, &identity.email, identity.admin, now)
            .map_err(|e| AuthError::Internal(format!("{e:#}")))?;
        Ok(MintedSession {
            credential,
            cookie: self.policy.issue(token),
        })
    }
}
