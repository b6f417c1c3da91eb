//! Klaxon Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - KLAXON_HOST: Bind address (default: 0.0.0.0)
//! - KLAXON_PORT: Port number (default: 9093)
//! - KLAXON_RULES_FILE: Rule, route and receiver file (default: rules.yml)
//! - KLAXON_EVAL_INTERVAL_SECS: Evaluation tick (default: 15)
//! - KLAXON_DELIVERY_WORKERS / KLAXON_DELIVERY_QUEUE: Delivery pool size and queue bound
//! - KLAXON_MAX_ATTEMPTS, KLAXON_BACKOFF_BASE_MS, KLAXON_BACKOFF_MAX_MS: Retry policy
//! - KLAXON_SCRAPE_TARGETS: Optional `job=url` list to scrape
//! - KLAXON_SECRET_PREFIX: Prefix for receiver secrets (default: KLAXON_SECRET_)
//! - RUST_LOG: Log level (default: info)
//!
//! Send SIGHUP or POST /-/reload to reload the rule file.

use klaxon::api::run_server;
use klaxon::config::ServerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klaxon=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    config.log_summary();

    println!(
        r#"
  _  ___
 | |/ / | __ ___  _____  _ __
 | ' /| |/ _` \ \/ / _ \| '_ \
 | . \| | (_| |>  < (_) | | | |
 |_|\_\_|\__,_/_/\_\___/|_| |_|

 Metrics-Driven Alert Evaluator
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config).await
}
