use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::error::{AuthError, AuthResult};
use crate::identity::{call_with_retry, is_admin_claim, Claims, IdentityProvider, ADMIN_CLAIM};
use crate::model::{Role, UserRoleDocument};
use crate::store::{DocumentStore, Records};

/// The full claims map to write back: the actual map with only `admin`
/// changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimUpdate {
    pub claims: Claims,
}

/// Diff between the desired role and the provider's actual claims. `None`
/// means the two already agree and nothing must be written.
pub fn reconcile(desired: Role, actual: &Claims) -> Option<ClaimUpdate> {
    let admin = is_admin_claim(actual);
    let target = match (desired, admin) {
        (Role::Admin, false) => true,
        (Role::Client, true) => false,
        _ => return None,
    };

    let mut claims = actual.clone();
    claims.insert(String::from(ADMIN_CLAIM), Value::Bool(target));
    Some(ClaimUpdate { claims })
}

/// Keeps the provider's admin claim convergent with each user's role
/// document. Every provider call goes through [`call_with_retry`].
pub struct ClaimsSyncService {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl ClaimsSyncService {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            timeout,
        }
    }

    /// Converges one principal. Returns whether a claim write was issued.
    /// Re-reads the current claims every time, so duplicate triggers are
    /// no-ops.
    pub async fn sync_user(&self, uid: &str, desired: Role) -> AuthResult<bool> {
        let principal = call_with_retry(self.timeout, || self.provider.get_user(uid)).await?;

        let update = match reconcile(desired, &principal.claims) {
            Some(update) => update,
            None => {
                debug!("Claims for {uid} already match role {desired}, skip");
                return Ok(false);
            }
        };

        call_with_retry(self.timeout, || {
            self.provider.set_custom_claims(uid, update.claims.clone())
        })
        .await?;
        info!("Set admin claim of {uid} to {}", desired == Role::Admin);
        Ok(true)
    }

    /// Trigger entry for a written role document. Errors are logged, the
    /// next write to the document retries convergence.
    pub async fn on_role_write(&self, user: &UserRoleDocument) {
        if let Err(e) = self.sync_user(&user.uid, user.desired_role()).await {
            error!("Sync claims for user {} failed: {e}", user.uid);
        }
    }

    /// Converges every role document, used once at start-up. Returns the
    /// number of claim writes issued.
    pub async fn reconcile_all(&self) -> AuthResult<usize> {
        let users = self.store.list_users().map_err(AuthError::store)?;
        let mut written = 0;
        for user in users.iter() {
            match self.sync_user(&user.uid, user.desired_role()).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconcile user {} failed: {e}", user.uid),
            }
        }
        info!(
            "Startup reconciliation checked {} users, updated {written}",
            users.len()
        );
        Ok(written)
    }

    /// Sets `admin: true` on the principal owning `email`, merged into its
    /// existing claims. The role document is promoted as well so a later
    /// trigger on it does not demote the principal again.
    pub async fn grant_admin(&self, email: &str) -> AuthResult<String> {
        let email = email.trim();
        if email.is_empty() {
            return Err(AuthError::InvalidArgument(String::from(
                "The function must be called with an email",
            )));
        }

        let result = async {
            let principal =
                call_with_retry(self.timeout, || self.provider.get_user_by_email(email)).await?;
            if let Some(update) = reconcile(Role::Admin, &principal.claims) {
                call_with_retry(self.timeout, || {
                    self.provider
                        .set_custom_claims(&principal.uid, update.claims.clone())
                })
                .await?;
            }
            Ok::<_, AuthError>(principal.uid)
        }
        .await;

        let uid = match result {
            Ok(uid) => uid,
            Err(e) => {
                error!("Grant admin to {email} failed: {e}");
                return Err(AuthError::Internal(String::from("grant admin failed")));
            }
        };

        if let Err(e) = self.store.set_role(&uid, Role::Admin) {
            warn!("Promote role document of {uid} failed: {e:#}");
        }
        info!("Granted admin to {email} ({uid})");
        Ok(uid)
    }
}
