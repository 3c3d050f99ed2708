use anyhow::{Context, Result};
use clap::Args;
use log::{debug, error, info};

use super::ConfigArgs;

/// Start the server (default command)
#[derive(Args, Default)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Print the loaded config as JSON and exit
    #[arg(long)]
    pub print_config: bool,
}

impl ServeArgs {
    pub async fn run(&self) -> Result<()> {
        let cfg = self.config.load()?;
        if self.print_config {
            let json = serde_json::to_string_pretty(&cfg).context("encode config")?;
            println!("{json}");
            return Ok(());
        }

        self.config.init_logs(&cfg)?;
        debug!("Server config: {:?}", cfg);

        let ctx = cfg.build_ctx()?;

        // Subscribe before anything writes so no change is missed.
        let changes = ctx.store.subscribe();

        let updated = ctx
            .claims
            .reconcile_all()
            .await
            .context("startup reconciliation")?;
        info!("Startup reconciliation done, {updated} claims updated");

        let triggers = ctx.triggers.clone();
        tokio::spawn(async move {
            triggers.run(changes).await;
            error!("Trigger dispatcher stopped");
        });

        let srv = cfg.build_restful_server(ctx)?;
        srv.run().await
    }
}
