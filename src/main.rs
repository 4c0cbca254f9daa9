//! DropServe binary.
//!
//! A long-running HTTP process plus a small CLI. `serve` wires the public and
//! control routes into one Axum router, runs the background sweeper, and
//! blocks until shutdown; `open` talks to a running server to create a portal
//! for the current directory and prints its URLs.

mod cli;
mod config;
mod control;
mod error;
mod frontend;
mod http;
mod idgen;
mod lanip;
mod logging;
mod pathsafe;
mod portals;
mod store;
mod sweeper;
mod uploads;

use anyhow::Context;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post, put};
use axum_server::Handle;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::config::{Cli, Command, OpenArgs, ServeArgs, ServerConfig};
use crate::store::Store;
use crate::sweeper::{SweepConfig, Sweeper, spawn_sweeper};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        None => cli::run_open(OpenArgs::default()).await,
        Some(Command::Open(args)) => cli::run_open(args).await,
        Some(Command::Serve(args)) => run_serve(args).await,
        Some(Command::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    logging::init_logging();

    let addr: SocketAddr = config::public_addr(args.port)
        .parse()
        .context("parse bind address")?;
    let store = Arc::new(Store::new());
    let server_config = Arc::new(ServerConfig::from_env());

    let app = Router::new()
        .route("/api/control/portals", post(control::create_portal))
        .route("/api/control/health", get(control::health))
        .route("/api/portals/{id}/info", get(portals::portal_info))
        .route("/api/portals/{id}/claim", post(portals::claim_portal))
        .route("/api/portals/{id}/preflight", post(portals::preflight))
        .route("/api/portals/{id}/uploads", post(portals::init_upload))
        .route("/api/portals/{id}/close", post(portals::close_portal))
        .route(
            "/api/uploads/{id}",
            put(uploads::stream_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/uploads/{id}/status", get(uploads::upload_status))
        .route("/p/{id}", get(frontend::portal_page))
        .route("/p/{id}/claimed", get(frontend::portal_page))
        .fallback(frontend::serve_frontend)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        "request",
                        request_id,
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(Extension(store.clone()))
        .layer(Extension(server_config));

    http::warn_if_public_bind(&addr);

    let sweeper = Sweeper::new(
        SweepConfig {
            temp_dir_name: config::temp_dir_name(),
            sweep_interval: config::sweep_interval(),
            part_max_age: config::part_max_age(),
            portal_idle_max_age: config::portal_idle_max_age(),
            roots: config::sweep_roots(),
        },
        store,
    );
    if let Err(err) = sweeper.run_once().await {
        warn!(error = %err, "startup sweep failed");
    }
    spawn_sweeper(sweeper);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("server listening on {addr}");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server failed")?;

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
}
