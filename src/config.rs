use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, io};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use openssl::ssl::{SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::ServerContext;
use crate::dirs;
use crate::gate::RouteTable;
use crate::identity::LocalIdentityProvider;
use crate::logs::LogsConfig;
use crate::restful::RestfulServer;
use crate::rsa;
use crate::store::object::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use crate::store::{DocumentStore, SqliteStore};

pub struct PathSet {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub pki_dir: PathBuf,
}

impl PathSet {
    pub fn new(config_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => match env::var_os("PORTAL_AUTH_CONFIG") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::config_dir()?,
            },
        };

        let data_dir = match data_dir {
            Some(dir) => dir,
            None => match env::var_os("PORTAL_AUTH_DATA") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::data_dir()?,
            },
        };

        let pki_dir = config_dir.join("pki");

        dirs::ensure_dir_exists(&config_dir)
            .with_context(|| format!("ensure config directory: {}", config_dir.display()))?;
        dirs::ensure_dir_exists(&data_dir)
            .with_context(|| format!("ensure data directory: {}", data_dir.display()))?;
        dirs::ensure_dir_exists(&pki_dir)
            .with_context(|| format!("ensure pki directory: {}", pki_dir.display()))?;

        Ok(Self {
            config_dir,
            data_dir,
            pki_dir,
        })
    }

    pub fn load_config<T, F>(&self, name: &str, default_func: F) -> Result<T>
    where
        T: CommonConfig + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let path = self.config_dir.join(format!("{name}.toml"));
        let mut cfg: T = match fs::read_to_string(&path) {
            Ok(s) => toml::from_str(&s).context("parse config toml")?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Config file for {name} not found, using defaults");
                default_func()
            }
            Err(err) => {
                return Err(err).context(format!("read config file: {}", path.display()));
            }
        };

        cfg.complete(self).context("validate config")?;
        Ok(cfg)
    }
}

pub trait CommonConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind")]
    pub bind: String,

    #[serde(default)]
    pub ssl: bool,

    pub keep_alive_secs: Option<u64>,

    pub workers: Option<u64>,

    #[serde(default = "ServerConfig::default_payload_limit_mib")]
    pub payload_limit_mib: u64,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub routes: RoutesConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    #[serde(skip)]
    pki_dir: PathBuf,

    #[serde(skip)]
    data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            ssl: false,
            keep_alive_secs: None,
            workers: None,
            payload_limit_mib: Self::default_payload_limit_mib(),
            session: SessionConfig::default(),
            identity: IdentityConfig::default(),
            store: StoreConfig::default(),
            routes: RoutesConfig::default(),
            logs: LogsConfig::default(),
            pki_dir: PathBuf::new(),
            data_dir: PathBuf::new(),
        }
    }
}

impl CommonConfig for ServerConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if self.bind.is_empty() {
            bail!("bind is required");
        }

        if let Some(keep_alive_secs) = self.keep_alive_secs {
            if keep_alive_secs == 0 {
                bail!("keep_alive_secs must be greater than 0");
            }
        }

        if let Some(workers) = self.workers {
            if workers == 0 {
                bail!("workers must be greater than 0");
            }
        }

        if self.payload_limit_mib == 0 {
            bail!("payload_limit_mib must be greater than 0");
        }

        self.session.complete(ps).context("session")?;
        self.identity.complete(ps).context("identity")?;
        self.store.complete(ps).context("store")?;
        self.routes.complete(ps).context("routes")?;
        self.logs.complete(ps).context("logs")?;

        self.pki_dir = ps.pki_dir.clone();
        self.data_dir = ps.data_dir.clone();

        Ok(())
    }
}

impl ServerConfig {
    pub fn build_identity_provider(&self) -> Result<Arc<LocalIdentityProvider>> {
        let (public_key, private_key) = self.read_keys("identity")?;
        let ttl = self.identity.id_token_ttl_secs;
        let provider = if self.identity.memory {
            warn!("Identity provider keeps principals in memory, they are lost on exit");
            LocalIdentityProvider::memory(&private_key, &public_key, ttl)?
        } else {
            let path = self.data_dir.join("identity.db");
            LocalIdentityProvider::open(&path, &private_key, &public_key, ttl)?
        };
        Ok(Arc::new(provider))
    }

    pub fn build_store(&self) -> Result<Arc<SqliteStore>> {
        let store = if self.store.memory {
            warn!("Document store is in memory, data is lost on exit");
            SqliteStore::memory()?
        } else {
            SqliteStore::open(&self.data_dir.join("portal.db"))?
        };
        Ok(Arc::new(store))
    }

    pub fn build_object_store(&self) -> Arc<dyn ObjectStore> {
        let prefix = self.store.object_url_prefix.clone();
        if self.store.memory {
            return Arc::new(MemoryObjectStore::new(prefix));
        }
        Arc::new(LocalObjectStore::new(self.store.object_dir.clone(), prefix))
    }

    pub fn build_ctx(&self) -> Result<Arc<ServerContext>> {
        let provider = self
            .build_identity_provider()
            .context("init identity provider")?;
        let store: Arc<dyn DocumentStore> = self.build_store().context("init document store")?;
        let objects = self.build_object_store();
        let (public_key, private_key) = self.read_keys("session")?;

        let ctx = ServerContext::new(
            self.clone(),
            provider,
            store,
            objects,
            &private_key,
            &public_key,
        )?;
        Ok(Arc::new(ctx))
    }

    pub fn build_restful_server(&self, ctx: Arc<ServerContext>) -> Result<RestfulServer> {
        let ssl = if self.ssl {
            Some(self.build_ssl()?)
        } else {
            None
        };
        let mut srv = RestfulServer::new(
            self.bind.clone(),
            ssl,
            ctx,
            self.payload_limit_mib as usize,
        );

        if let Some(keep_alive_secs) = self.keep_alive_secs {
            srv.set_keep_alive_secs(keep_alive_secs);
        }

        if let Some(workers) = self.workers {
            srv.set_workers(workers);
        }

        Ok(srv)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.identity.call_timeout_ms)
    }

    /// Reads `pki/{name}_public.pem` and `pki/{name}_private.pem`, generating
    /// a new pair when either is missing.
    fn read_keys(&self, name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let public_key_path = self.pki_dir.join(format!("{name}_public.pem"));
        let private_key_path = self.pki_dir.join(format!("{name}_private.pem"));
        if public_key_path.exists() && private_key_path.exists() {
            let public_key = fs::read(&public_key_path)
                .with_context(|| format!("read {name} public key"))?;
            let private_key = fs::read(&private_key_path)
                .with_context(|| format!("read {name} private key"))?;
            return Ok((public_key, private_key));
        }

        info!("Keys for {name} tokens not exist, try to generate new ones");
        let (public_key, private_key) =
            rsa::generate_rsa_keys().with_context(|| format!("generate keys for {name}"))?;

        fs::write(&public_key_path, &public_key)
            .with_context(|| format!("write {name} public key"))?;
        fs::write(&private_key_path, &private_key)
            .with_context(|| format!("write {name} private key"))?;

        Ok((public_key, private_key))
    }

    fn build_ssl(&self) -> Result<SslAcceptorBuilder> {
        let key_path = self.pki_dir.join("key.pem");
        if !key_path.exists() {
            bail!("ssl key file not exists: {:?}", key_path);
        }

        let cert_path = self.pki_dir.join("cert.pem");
        if !cert_path.exists() {
            bail!("ssl cert file not exists: {:?}", cert_path);
        }

        let mut builder =
            SslAcceptor::mozilla_intermediate(SslMethod::tls()).context("init ssl acceptor")?;

        builder
            .set_private_key_file(&key_path, SslFiletype::PEM)
            .context("load ssl key file")?;
        builder
            .set_certificate_chain_file(&cert_path)
            .context("load ssl cert file")?;

        Ok(builder)
    }

    fn default_bind() -> String {
        String::from("127.0.0.1:13580")
    }

    fn default_payload_limit_mib() -> u64 {
        32
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_cookie_name")]
    pub cookie_name: String,

    /// Policy window of a session credential, also the cookie's Max-Age
    #[serde(default = "SessionConfig::default_max_age_secs")]
    pub max_age_secs: u64,

    /// Sets the `Secure` cookie attribute, turn off only for local plain
    /// HTTP development
    #[serde(default = "SessionConfig::default_secure")]
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: Self::default_cookie_name(),
            max_age_secs: Self::default_max_age_secs(),
            secure: Self::default_secure(),
        }
    }
}

impl CommonConfig for SessionConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        if self.cookie_name.is_empty() {
            bail!("cookie_name is required");
        }
        if self
            .cookie_name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | ',' | '='))
        {
            bail!("cookie_name '{}' is invalid", self.cookie_name);
        }

        if self.max_age_secs < Self::MIN_MAX_AGE_SECS || self.max_age_secs > Self::MAX_MAX_AGE_SECS
        {
            bail!(
                "max_age_secs must be in range [{}, {}]",
                Self::MIN_MAX_AGE_SECS,
                Self::MAX_MAX_AGE_SECS
            );
        }

        Ok(())
    }
}

impl SessionConfig {
    const MIN_MAX_AGE_SECS: u64 = 300;
    const MAX_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 5;

    fn default_cookie_name() -> String {
        String::from("__session")
    }

    fn default_max_age_secs() -> u64 {
        60 * 60 // 1 hour
    }

    fn default_secure() -> bool {
        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "IdentityConfig::default_id_token_ttl_secs")]
    pub id_token_ttl_secs: u64,

    /// Per-attempt timeout of an identity provider call
    #[serde(default = "IdentityConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default)]
    pub memory: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id_token_ttl_secs: Self::default_id_token_ttl_secs(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            memory: false,
        }
    }
}

impl CommonConfig for IdentityConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        if self.id_token_ttl_secs < Self::MIN_ID_TOKEN_TTL_SECS
            || self.id_token_ttl_secs > Self::MAX_ID_TOKEN_TTL_SECS
        {
            bail!(
                "id_token_ttl_secs must be in range [{}, {}]",
                Self::MIN_ID_TOKEN_TTL_SECS,
                Self::MAX_ID_TOKEN_TTL_SECS
            );
        }

        if self.call_timeout_ms == 0 {
            bail!("call_timeout_ms must be greater than 0");
        }

        Ok(())
    }
}

impl IdentityConfig {
    const MIN_ID_TOKEN_TTL_SECS: u64 = 60;
    const MAX_ID_TOKEN_TTL_SECS: u64 = 60 * 60 * 24;

    fn default_id_token_ttl_secs() -> u64 {
        60 * 60
    }

    fn default_call_timeout_ms() -> u64 {
        5000
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub memory: bool,

    /// Defaults to `<data_dir>/objects`
    #[serde(default)]
    pub object_dir: PathBuf,

    #[serde(default = "StoreConfig::default_object_url_prefix")]
    pub object_url_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory: false,
            object_dir: PathBuf::new(),
            object_url_prefix: Self::default_object_url_prefix(),
        }
    }
}

impl CommonConfig for StoreConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if self.object_dir.as_os_str().is_empty() {
            self.object_dir = ps.data_dir.join("objects");
        }
        if !self.memory {
            dirs::ensure_dir_exists(&self.object_dir).context("ensure object dir")?;
        }

        if self.object_url_prefix.is_empty() {
            bail!("object_url_prefix is required");
        }

        Ok(())
    }
}

impl StoreConfig {
    fn default_object_url_prefix() -> String {
        String::from("/objects")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoutesConfig {
    #[serde(default = "RoutesConfig::default_landing")]
    pub landing: String,

    #[serde(default = "RoutesConfig::default_sign_in")]
    pub sign_in: String,

    #[serde(default = "RoutesConfig::default_non_admin_landing")]
    pub non_admin_landing: String,

    #[serde(default = "RoutesConfig::default_protected")]
    pub protected: Vec<String>,

    #[serde(default = "RoutesConfig::default_admin")]
    pub admin: Vec<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            landing: Self::default_landing(),
            sign_in: Self::default_sign_in(),
            non_admin_landing: Self::default_non_admin_landing(),
            protected: Self::default_protected(),
            admin: Self::default_admin(),
        }
    }
}

impl CommonConfig for RoutesConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        let singles = [
            ("landing", &self.landing),
            ("sign_in", &self.sign_in),
            ("non_admin_landing", &self.non_admin_landing),
        ];
        for (name, path) in singles {
            if !path.starts_with('/') {
                bail!("{name} must be an absolute path, got '{path}'");
            }
        }

        for path in self.protected.iter().chain(self.admin.iter()) {
            if !path.starts_with('/') || path == "/" {
                bail!("route prefix '{path}' must be an absolute path other than '/'");
            }
            if path.starts_with("/api") {
                bail!("route prefix '{path}' overlaps the api routes");
            }
        }

        if self.admin.iter().any(|p| self.non_admin_landing.starts_with(p.as_str())) {
            bail!("non_admin_landing must not be an admin route");
        }

        Ok(())
    }
}

impl RoutesConfig {
    pub fn route_table(&self) -> RouteTable {
        RouteTable {
            landing: self.landing.clone(),
            sign_in: self.sign_in.clone(),
            non_admin_landing: self.non_admin_landing.clone(),
            protected: self.protected.clone(),
            admin: self.admin.clone(),
        }
    }

    fn default_landing() -> String {
        String::from("/")
    }

    fn default_sign_in() -> String {
        String::from("/login")
    }

    fn default_non_admin_landing() -> String {
        String::from("/portal")
    }

    fn default_protected() -> Vec<String> {
        vec![String::from("/dashboard"), String::from("/portal")]
    }

    fn default_admin() -> Vec<String> {
        vec![String::from("/admin")]
    }
}
