use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portal_auth::config::{PathSet, ServerConfig};
use portal_auth::logs;

mod serve;
mod set_role;
mod sign_in;

/// Session gate, claims sync and file approval service for a client portal
#[derive(Parser)]
#[command(author, version = env!("PORTAL_AUTH_VERSION"), about)]
pub struct App {
    #[command(subcommand)]
    pub commands: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    Serve(serve::ServeArgs),
    SignIn(sign_in::SignInArgs),
    SetRole(set_role::SetRoleArgs),
}

impl App {
    pub async fn run(&self) -> Result<()> {
        match &self.commands {
            Some(Commands::Serve(args)) => args.run().await,
            Some(Commands::SignIn(args)) => args.run().await,
            Some(Commands::SetRole(args)) => args.run().await,
            None => serve::ServeArgs::default().run().await,
        }
    }
}

#[derive(Args, Default)]
pub struct ConfigArgs {
    /// Config directory, default is $PORTAL_AUTH_CONFIG, then /etc/portal-auth
    /// for root or ~/.config/portal-auth
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Data directory, default is $PORTAL_AUTH_DATA, then /var/lib/portal-auth
    /// for root or ~/.local/share/portal-auth
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Override the log level from config (error, warn, info, debug)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<ServerConfig> {
        let ps = PathSet::new(self.config_dir.clone(), self.data_dir.clone())?;
        let mut cfg: ServerConfig = ps
            .load_config("server", ServerConfig::default)
            .context("load server config")?;
        if let Some(level) = self.log_level.as_ref() {
            cfg.logs.level = level.clone();
        }
        Ok(cfg)
    }

    pub fn init_logs(&self, cfg: &ServerConfig) -> Result<()> {
        logs::init(&cfg.logs.level)
    }
}
