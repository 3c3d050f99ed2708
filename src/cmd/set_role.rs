use anyhow::{Context, Result};
use clap::Args;
use portal_auth::identity::IdentityProvider;
use portal_auth::model::Role;
use portal_auth::store::Records;

use super::ConfigArgs;

/// Write a user's desired role; the claim follows on the next sync
#[derive(Args)]
pub struct SetRoleArgs {
    /// The principal's email
    pub email: String,

    /// admin or client
    pub role: String,

    #[command(flatten)]
    pub config: ConfigArgs,
}

impl SetRoleArgs {
    pub async fn run(&self) -> Result<()> {
        let role: Role = self.role.parse()?;

        let cfg = self.config.load()?;
        self.config.init_logs(&cfg)?;

        let provider = cfg
            .build_identity_provider()
            .context("init identity provider")?;
        let store = cfg.build_store().context("init document store")?;

        let principal = provider
            .get_user_by_email(&self.email)
            .await
            .with_context(|| format!("find principal {}", self.email))?;
        store.set_role(&principal.uid, role)?;

        println!("Role of {} ({}) set to {role}", self.email, principal.uid);
        Ok(())
    }
}
