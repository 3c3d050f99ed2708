use std::sync::Arc;

use anyhow::{Context, Result};

use crate::claims::ClaimsSyncService;
use crate::config::ServerConfig;
use crate::gate::AuthorizationGate;
use crate::identity::IdentityProvider;
use crate::session::{CookiePolicy, SessionLifecycleManager, SessionTokenSigner, SessionTokenVerifier};
use crate::store::object::ObjectStore;
use crate::store::DocumentStore;
use crate::triggers::TriggerDispatcher;

/// Everything a request handler or background task needs, built once at
/// start-up. Collaborators are passed in explicitly so tests can substitute
/// in-memory ones.
pub struct ServerContext {
    pub store: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub provider: Arc<dyn IdentityProvider>,

    pub sessions: SessionLifecycleManager,
    pub claims: Arc<ClaimsSyncService>,
    pub triggers: Arc<TriggerDispatcher>,
    pub gate: Arc<AuthorizationGate>,

    pub cfg: ServerConfig,
}

impl ServerContext {
    pub fn new(
        cfg: ServerConfig,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        session_private_key: &[u8],
        session_public_key: &[u8],
    ) -> Result<Self> {
        let timeout = cfg.call_timeout();

        let signer = SessionTokenSigner::new(session_private_key, cfg.session.max_age_secs)
            .context("init session signer")?;
        let verifier = Arc::new(
            SessionTokenVerifier::new(session_public_key).context("init session verifier")?,
        );
        let policy = CookiePolicy {
            name: cfg.session.cookie_name.clone(),
            max_age: cfg.session.max_age_secs,
            secure: cfg.session.secure,
        };

        let sessions = SessionLifecycleManager::new(
            provider.clone(),
            store.clone(),
            signer,
            verifier.clone(),
            policy,
            timeout,
        );
        let claims = Arc::new(ClaimsSyncService::new(
            provider.clone(),
            store.clone(),
            timeout,
        ));
        let triggers = Arc::new(TriggerDispatcher::new(
            store.clone(),
            objects.clone(),
            claims.clone(),
        ));
        let gate = Arc::new(AuthorizationGate::new(
            cfg.routes.route_table(),
            cfg.session.cookie_name.clone(),
            verifier,
        ));

        Ok(Self {
            store,
            objects,
            provider,
            sessions,
            claims,
            triggers,
            gate,
            cfg,
        })
    }

    #[cfg(test)]
    pub fn new_test() -> (Self, Arc<crate::identity::LocalIdentityProvider>) {
        use crate::identity::LocalIdentityProvider;
        use crate::store::object::MemoryObjectStore;
        use crate::store::SqliteStore;

        let provider = Arc::new(LocalIdentityProvider::new_test());
        let ctx = Self::new(
            ServerConfig::default(),
            provider.clone(),
            Arc::new(SqliteStore::memory().unwrap()),
            Arc::new(MemoryObjectStore::new(String::from("/objects"))),
            include_bytes!("testdata/session_private.pem"),
            include_bytes!("testdata/session_public.pem"),
        )
        .unwrap();
        (ctx, provider)
    }
}
