#![warn(clippy::dbg_macro)]

use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use anyhow::{bail, Context, Result};

mod analytics;
mod cacheinfo;
mod catalog;
mod config;
mod deltacache;
mod differ;
mod download;
mod error;
mod nar;
mod narinfo;
mod simulate;
mod subst;
mod syschecker;

use analytics::Analytics;
use catalog::Catalog;
use error::ServerResult;
use subst::Subst;
use syschecker::SysChecker;

async fn not_found() -> ServerResult {
    Ok(HttpResponse::NotFound().finish())
}

fn normalize_bind(bind: &str) -> String {
    // accept the ":port" shorthand for all interfaces
    if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    }
}

fn build_substituter(cfg: &Arc<config::Config>, http: &reqwest::Client) -> (Arc<Catalog>, Arc<Subst>) {
    let checker = Arc::new(SysChecker::new(cfg.clone(), http.clone()));
    let catalog = Arc::new(Catalog::new(cfg.clone(), checker));
    let subst = Subst::new(
        cfg.clone(),
        catalog.clone(),
        Analytics::open(&cfg.analytics_file),
        http.clone(),
    );
    (catalog, subst)
}

/// Exit once no request has arrived for the configured idle time. Only
/// armed under the platform activation layer, which restarts us on the
/// next connection.
fn exit_on_idle(subst: Arc<Subst>, idle: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if subst.idle_for() > idle {
                log::info!("idle for {:?}, exiting", subst.idle_for());
                std::process::exit(0);
            }
        }
    });
}

fn socket_activated() -> bool {
    std::env::var_os("LISTEN_PID").is_some()
}

async fn inner_main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Arc::new(config::load()?);
    let http = reqwest::Client::new();

    match (&cfg.simulate_reqs, &cfg.simulate_bases) {
        (Some(reqs), Some(bases)) => {
            if cfg.run_differ {
                let differ = differ::Differ::new(cfg.clone(), http.clone())
                    .context("Failed to size the differ disk budget")?;
                let data = web::Data::new(differ);
                let bind = normalize_bind(&cfg.differ_bind);
                let server = HttpServer::new(move || {
                    App::new().app_data(data.clone()).route(
                        nardelta_protocol::DIFFER_PATH,
                        web::post().to(differ::post),
                    )
                })
                .bind(&bind)
                .with_context(|| format!("Failed to bind differ to {bind}"))?
                .run();
                tokio::spawn(server);
            }
            let (catalog, subst) = build_substituter(&cfg, &http);
            return simulate::run(reqs, bases, catalog, subst).await;
        }
        (None, None) => {}
        _ => bail!("simulation needs both nardelta_simulate_reqs and nardelta_simulate_bases"),
    }

    let mut servers = Vec::new();

    if cfg.run_substituter {
        let (catalog, subst) = build_substituter(&cfg, &http);
        catalog.start();

        if socket_activated() && !cfg.subst_idle_time.is_zero() {
            exit_on_idle(subst.clone(), cfg.subst_idle_time);
        }

        let data = web::Data::new(subst);
        let bind = normalize_bind(&cfg.substituter_bind);
        log::info!("substituter listening on {bind}");
        let server = HttpServer::new(move || {
            App::new()
                .wrap(middleware::Logger::default())
                .app_data(data.clone())
                .route("/nix-cache-info", web::get().to(cacheinfo::get))
                .route("/log/{drv:.*}", web::get().to(not_found))
                .route("/nar/{name}.nar", web::get().to(nar::get))
                .route("/{hash}.narinfo", web::get().to(narinfo::get))
                .route("/{hash}.narinfo", web::head().to(narinfo::get))
                .route("/{hash}.ls", web::get().to(narinfo::reject_listing))
                .route("/{hash}.ls", web::head().to(narinfo::reject_listing))
        })
        // default is 5 seconds, which is too small when doing mass requests
        .client_request_timeout(Duration::from_secs(30))
        .bind(&bind)
        .with_context(|| format!("Failed to bind substituter to {bind}"))?
        .run();
        servers.push(server);
    }

    if cfg.run_differ {
        let differ = differ::Differ::new(cfg.clone(), http.clone())
            .context("Failed to size the differ disk budget")?;
        let data = web::Data::new(differ);
        let bind = normalize_bind(&cfg.differ_bind);
        log::info!("differ listening on {bind}");
        let server = HttpServer::new(move || {
            App::new()
                .wrap(middleware::Logger::default())
                .app_data(data.clone())
                .route(
                    nardelta_protocol::DIFFER_PATH,
                    web::post().to(differ::post),
                )
        })
        .client_request_timeout(Duration::from_secs(30))
        .bind(&bind)
        .with_context(|| format!("Failed to bind differ to {bind}"))?
        .run();
        servers.push(server);
    }

    if servers.is_empty() {
        bail!("neither substituter nor differ is enabled");
    }

    futures::future::try_join_all(servers)
        .await
        .context("server error")?;
    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    inner_main().await.map_err(std::io::Error::other)
}
