use std::sync::Arc;
use std::time::Duration;

use actix_web::middleware::from_fn;
use actix_web::web::{self, Data, PayloadConfig, ServiceConfig};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use log::{info, warn};
use openssl::ssl::SslAcceptorBuilder;
use sd_notify::NotifyState;

use crate::context::ServerContext;
use crate::gate;
use crate::handlers::{admin, pages, projects, session};
use crate::response::Response;

pub struct RestfulServer {
    ssl: Option<SslAcceptorBuilder>,
    ctx: Arc<ServerContext>,

    keep_alive_secs: Option<u64>,
    workers: Option<u64>,

    bind: String,

    payload_limit_mib: usize,
}

impl RestfulServer {
    pub fn new(
        bind: String,
        ssl: Option<SslAcceptorBuilder>,
        ctx: Arc<ServerContext>,
        payload_limit_mib: usize,
    ) -> Self {
        Self {
            ssl,
            ctx,
            keep_alive_secs: None,
            workers: None,
            bind,
            payload_limit_mib,
        }
    }

    pub fn set_keep_alive_secs(&mut self, keep_alive_secs: u64) {
        self.keep_alive_secs = Some(keep_alive_secs);
    }

    pub fn set_workers(&mut self, workers: u64) {
        self.workers = Some(workers);
    }

    pub async fn run(mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let payload_limit_mib = self.payload_limit_mib;
        let mut srv = HttpServer::new(move || {
            App::new()
                .wrap(from_fn(gate::authorize))
                .configure(configure(ctx.clone(), payload_limit_mib))
                .default_service(web::route().to(default_handler))
        });

        if let Some(ssl) = self.ssl.take() {
            info!("Binding to https://{}", self.bind);
            srv = srv.bind_openssl(&self.bind, ssl).context("bind with ssl")?
        } else {
            warn!("Using HTTP (without SSL). THIS IS DANGEROUS, DO NOT USE IN PRODUCTION");
            info!("Binding to http://{}", self.bind);
            srv = srv.bind(&self.bind).context("bind without ssl")?
        };

        if let Some(keep_alive) = self.keep_alive_secs {
            srv = srv.keep_alive(Duration::from_secs(keep_alive));
        }
        if let Some(workers) = self.workers {
            srv = srv.workers(workers as usize);
        }

        sd_notify::notify(true, &[NotifyState::Ready]).context("notify systemd")?;
        info!("Starting restful server");
        srv.run().await.context("run server")?;

        info!("Server stopped by user");
        Ok(())
    }
}

/// Shared state and every route. The gate middleware and the default
/// handler are attached on the `App` itself.
pub fn configure(ctx: Arc<ServerContext>, payload_limit_mib: usize) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg| {
        let routes = ctx.cfg.routes.clone();

        cfg.app_data(Data::new(ctx.clone()))
            .app_data(Data::from(ctx.gate.clone()))
            .app_data(PayloadConfig::new(payload_limit_mib * 1024 * 1024))
            .route("/healthz", web::get().to(pages::healthz))
            .route(&routes.landing, web::get().to(pages::landing))
            .route(&routes.sign_in, web::get().to(pages::sign_in))
            .service(
                web::scope("/api")
                    .route("/session", web::post().to(session::mint))
                    .route("/session/refresh", web::post().to(session::refresh))
                    .route("/session/logout", web::post().to(session::logout))
                    .route("/admin/grant", web::post().to(admin::grant))
                    .route("/users/{uid}/role", web::put().to(admin::set_role))
                    .route("/projects", web::get().to(projects::list_projects))
                    .route("/projects", web::post().to(projects::create_project))
                    .route("/projects/{pid}/files", web::get().to(projects::list_files))
                    .route("/projects/{pid}/files", web::post().to(projects::upload_file))
                    .route(
                        "/projects/{pid}/files/{fid}/toggle",
                        web::post().to(projects::toggle_file),
                    ),
            );

        for prefix in routes.protected.iter().chain(routes.admin.iter()) {
            cfg.route(prefix, web::get().to(pages::page));
            cfg.route(&format!("{prefix}/{{tail:.*}}"), web::get().to(pages::page));
        }
    }
}

pub async fn default_handler(req: HttpRequest) -> HttpResponse {
    Response::not_found(req.method().as_str(), req.path()).into()
}
