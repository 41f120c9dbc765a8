// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{Router, routing::get};
use hyper::Server;
use std::{net::SocketAddr, process::exit, sync::Arc};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirrorbolt::api::{self, AppState};
use mirrorbolt::config::{CONFIG, Config, TelemetryBackend};
use mirrorbolt::registry::MirrorRegistry;
use mirrorbolt::telemetry::{
    MirrorRequestStore, memory::MemoryRequestStore, mysql::MySqlRequestStore,
};

/// ----------------------------
/// CLI ARGUMENT STRUCTURE
/// ----------------------------
/// Defines CLI arguments that can be passed to the binary,
/// such as the path to the configuration file.
/// Defaults to "config.yaml" if not provided.
#[derive(Parser, Debug)]
#[command(
    name = "MirrorBolt",
    version = "0.1.0",
    about = "Beatmap mirror aggregation gateway with adaptive upstream selection"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

/// Initializes structured logging using the `LOG_LEVEL` environment variable.
/// Falls back to "info" if not set.
fn init_logging(app_id: &str) {
    let filter = EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("🚀 Logging initialized for app_id: {app_id}");
}

/// Builds the telemetry store selected by the config: MySQL for shared
/// cross-instance learning, or the in-memory store for single-instance
/// and development runs.
async fn init_telemetry_store(config: &Config) -> Arc<dyn MirrorRequestStore> {
    match config.telemetry.backend {
        TelemetryBackend::Mysql => {
            let dsn = config
                .telemetry
                .dsn
                .as_deref()
                .expect("validated: mysql backend requires telemetry.dsn");
            match MySqlRequestStore::connect(
                dsn,
                config.selection.initial_weight,
                config.selection.window_hours,
            )
            .await
            {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("❌ Failed to connect telemetry store: {e}");
                    exit(1);
                }
            }
        }
        TelemetryBackend::Memory => {
            info!("🗄 In-memory telemetry store selected (single-instance weighting).");
            Arc::new(MemoryRequestStore::new(
                config.selection.initial_weight,
                config.selection.window_hours,
            ))
        }
    }
}

/// ---------------------------
/// APPLICATION ENTRY POINT
/// ---------------------------
/// Starts the gateway using Axum and initializes all required components:
/// config loading, telemetry store, mirror registry, and the HTTP servers.
#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    // ------------------------------------------------------
    // 1. Parse CLI arguments (e.g., --config=config.prod.yaml)
    // ------------------------------------------------------
    let args = Args::parse();

    // ------------------------------------------------------
    // 2. Load configuration from YAML file
    // ------------------------------------------------------
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from '{}': {e}", args.config);
            exit(1);
        }
    };

    // ------------------------------------------------------
    // 3. Initialize the logger using app_id for context
    // ------------------------------------------------------
    init_logging(&config.app_id);
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("❌ Failed to install Prometheus recorder");

    // ------------------------------------------------------
    // 4. Set global CONFIG (OnceCell) for use across modules
    // ------------------------------------------------------
    CONFIG.set(config).expect("❌ CONFIG was already initialized");
    let config = CONFIG.get().expect("CONFIG must be initialized");

    // ------------------------------------------------------
    // 5. Initialize the telemetry store (MySQL or memory)
    // ------------------------------------------------------
    let store = init_telemetry_store(config).await;

    // ------------------------------------------------------
    // 6. Build the mirror registry: one shared Mirror per upstream,
    //    one selection pool per resource kind.
    // ------------------------------------------------------
    let registry = match MirrorRegistry::from_config(config, store) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("❌ Failed to build mirror registry: {e}");
            exit(1);
        }
    };

    // ------------------------------------------------------
    // 7. Build the gateway router (all client-facing routes)
    //    and the admin router (Prometheus metrics).
    // ------------------------------------------------------
    let proxy_router = api::router(AppState { registry });
    let admin_router = Router::new().route("/metrics", get(move || async move { handle.render() }));

    // ------------------------------------------------------
    // 8. Bind both servers and serve concurrently
    // ------------------------------------------------------
    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.admin_port));

    info!("🚀 Gateway listening at http://{}", proxy_addr);
    info!("🛠 Metrics at http://{}/metrics", admin_addr);

    let proxy_server = Server::bind(&proxy_addr).serve(proxy_router.into_make_service());
    let admin_server = Server::bind(&admin_addr).serve(admin_router.into_make_service());

    let (proxy_result, admin_result) = tokio::join!(proxy_server, admin_server);

    if let Err(e) = proxy_result {
        error!("❌ Gateway server exited with error: {}", e);
    }
    if let Err(e) = admin_result {
        error!("❌ Admin server exited with error: {}", e);
    }
}
