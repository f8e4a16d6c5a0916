//! # Matchroom — Multiplayer Chess Server
//!
//! Matchroom is a stateful chess session server. It accepts human players
//! and programmatic agents over HTTP and WebSocket push channels,
//! arbitrates the rules authoritatively, runs per-game clocks, pairs
//! waiting players by preference, propagates every state change to all
//! subscribers within and across server nodes, and maintains Elo ladders
//! for players and for named agents.
//!
//! ## Architecture
//!
//! - **Rules engine** (`engine`, `types`): pure legality, SAN, FEN.
//! - **Store** (`store`): one shared SQL database for all nodes; games
//!   mutate only through a version-guarded conditional update.
//! - **State machine** (`game`): the single mutator of games; one event
//!   envelope per successful transition.
//! - **Hub + push channels** (`hub`, `ws`): local fan-out with bounded
//!   per-subscriber queues.
//! - **Event bus** (`bus`): cross-node delivery through an append-only
//!   log that every node tails.
//! - **Matchmaker** (`matchmaker`) with builtin-agent fallback (`agent`).
//! - **Sweeper** (`sweeper`): recovers clock timeouts lost to restarts.
//!
//! ## Usage
//!
//! ```bash
//! # Start the server (default: http://0.0.0.0:8080)
//! matchroom serve
//!
//! # Custom bind address
//! matchroom serve --host 127.0.0.1 --port 3000
//! ```
//!
//! Swagger UI is served at `/swagger-ui/`; configuration comes from the
//! environment (see `config`).

pub mod agent;
pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod game;
pub mod hub;
pub mod matchmaker;
pub mod model;
pub mod rating;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod ws;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::agent::BuiltinAgent;
use crate::api::{ApiDoc, AppState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::game::GameManager;
use crate::hub::SessionHub;
use crate::matchmaker::Matchmaker;
use crate::store::GameStore;
use crate::sweeper::Sweeper;

/// Matchroom — a multiplayer chess server.
#[derive(Parser, Debug)]
#[command(name = "matchroom")]
#[command(about = "Multiplayer chess server with matchmaking and Elo ladders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP + WebSocket server.
    Serve {
        /// Port to listen on (overrides BIND_PORT).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host address to bind to (overrides BIND_HOST).
        #[arg(long)]
        host: Option<String>,
    },
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, host } => run_server(host, port).await,
    }
}

fn io_err(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

/// Wires the subsystems together, spawns the background tasks, and runs
/// the HTTP server.
async fn run_server(host: Option<String>, port: Option<u16>) -> std::io::Result<()> {
    let mut config = Config::from_env();
    if let Some(host) = host {
        config.bind_host = host;
    }
    if let Some(port) = port {
        config.bind_port = port;
    }

    // Shared store; one database serves every node.
    let pool = store::connect(&config.database_url).await.map_err(io_err)?;
    let store = GameStore::new(pool);
    store.init_schema().await.map_err(io_err)?;

    // The system account that owns the builtin agent.
    let system_account = agent::ensure_system_account(&store).await.map_err(io_err)?;

    let node_id = Uuid::new_v4();
    let hub = SessionHub::new().start();
    let bus = Arc::new(EventBus::new(store.clone(), Some(hub.clone()), node_id));
    let games = GameManager::new(store.clone(), bus.clone(), config.clone());

    let builtin = BuiltinAgent::new(
        format!("http://127.0.0.1:{}/api", config.bind_port),
        &system_account,
    );
    let matchmaker = Matchmaker::new(
        store.clone(),
        bus.clone(),
        games.clone(),
        config.clone(),
        Some(builtin),
    );

    // Background tasks: log tailing, retention, pairing, timeout recovery.
    tokio::spawn(
        bus.clone()
            .run_tailer(Duration::from_millis(config.bus_poll_ms)),
    );
    tokio::spawn(bus.clone().run_retention(config.event_retention_secs));
    tokio::spawn(matchmaker.clone().run());
    tokio::spawn(Sweeper::new(games.clone(), bus.clone(), config.sweeper_tick_secs).run());

    let openapi = ApiDoc::openapi();
    let bind = (config.bind_host.clone(), config.bind_port);

    log::info!("node {} starting on {}:{}", node_id, bind.0, bind.1);
    log::info!("API base URL: http://{}:{}/api", bind.0, bind.1);
    log::info!("Swagger UI:   http://{}:{}/swagger-ui/", bind.0, bind.1);
    log::info!(
        "push channels: ws://{}:{}/ws/games/{{sessionId}} | /ws/matchmaking/{{connectionId}} | /ws/lobby",
        bind.0,
        bind.1
    );

    HttpServer::new(move || {
        let cors = match &config.cors_origin {
            Some(origin) => Cors::default()
                .allowed_origin(origin)
                .allow_any_method()
                .allow_any_header()
                .max_age(3600),
            None => Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600),
        };

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(AppState {
                store: store.clone(),
                games: games.clone(),
                matchmaker: matchmaker.clone(),
                hub: hub.clone(),
                config: config.clone(),
            }))
            .configure(api::configure_routes)
            .route("/ws/games/{session_id}", web::get().to(ws::game_channel))
            .route(
                "/ws/matchmaking/{connection_id}",
                web::get().to(ws::matchmaking_channel),
            )
            .route("/ws/lobby", web::get().to(ws::lobby_channel))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind(bind)?
    .run()
    .await
}
