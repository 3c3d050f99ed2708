use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;

use super::ConfigArgs;

/// Sign in with the bundled identity provider and print an identity token
#[derive(Args)]
pub struct SignInArgs {
    /// The principal's email, registered on first sign-in
    pub email: String,

    #[command(flatten)]
    pub config: ConfigArgs,
}

impl SignInArgs {
    pub async fn run(&self) -> Result<()> {
        let cfg = self.config.load()?;
        self.config.init_logs(&cfg)?;

        let provider = cfg
            .build_identity_provider()
            .context("init identity provider")?;
        let now = Utc::now().timestamp() as u64;
        let token = provider.sign_in(&self.email, now)?;

        println!("{token}");
        Ok(())
    }
}
