use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    health_check, ingest, list_alerts, list_deliveries, list_rules, metrics, reload, stats,
    AppState,
};
use crate::alerts::EvaluationLoop;
use crate::config::{ConfigLoader, ServerConfig};
use crate::ingest::Scraper;
use crate::metrics::Metrics;
use crate::notify::{DeliveryLog, Dispatcher, EnvSecretStore, SecretStore};
use crate::rules::duration_millis;
use crate::storage::SeriesStore;

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Metric ingestion
        .route("/ingest", post(ingest))
        // Alert state and configuration
        .route("/alerts", get(list_alerts))
        .route("/rules", get(list_rules))
        .route("/-/reload", post(reload))
        // Delivery and internal state
        .route("/deliveries", get(list_deliveries))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the evaluator and its HTTP server until a shutdown signal
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(SeriesStore::new());
    let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore::new(config.secret_prefix.clone()));

    // An invalid rule file at startup is fatal
    let loader = Arc::new(ConfigLoader::init(
        &config.rules_file,
        secrets,
        config.dispatcher.attempt_timeout,
        Arc::clone(&metrics),
    )?);
    store.set_retention_ms(duration_millis(loader.current().retention()));

    // Delivery pool
    let deliveries = Arc::new(DeliveryLog::default());
    let (dispatcher, dispatch) = Dispatcher::new(
        config.dispatcher.clone(),
        Arc::clone(&metrics),
        Arc::clone(&deliveries),
    );
    let dispatcher_task = dispatcher.start();

    // Evaluation loop
    let (eval_loop, alerts) = EvaluationLoop::new(
        Arc::clone(&store),
        loader.subscribe(),
        dispatch,
        Arc::clone(&metrics),
        config.eval_interval,
    );
    let eval_task = eval_loop.start();

    // Optional pull scraper
    let scraper = if config.scrape_targets.is_empty() {
        None
    } else {
        let scraper = Arc::new(Scraper::new(
            Arc::clone(&store),
            config.scrape_targets.clone(),
            config.scrape_interval,
        )?);
        let handle = Arc::clone(&scraper).start();
        Some((scraper, handle))
    };

    let reload_handle = tokio::spawn(reload_on_hangup(Arc::clone(&loader)));

    let state = Arc::new(AppState {
        store,
        loader,
        alerts,
        deliveries,
        metrics,
        started_at: chrono::Utc::now().timestamp_millis(),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Klaxon on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown signal received, stopping workers...");
    reload_handle.abort();
    if let Some((scraper, handle)) = scraper {
        scraper.stop();
        handle.abort();
    }

    // The loop finishes its current tick before the dispatcher drains
    eval_task.shutdown().await;
    dispatcher_task.shutdown().await;

    tracing::info!("Klaxon stopped");
    Ok(())
}

#[cfg(unix)]
async fn reload_on_hangup(loader: Arc<ConfigLoader>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGHUP handler, reload via HTTP only");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        tracing::info!(path = %loader.path().display(), "SIGHUP received, reloading rule file");
        // Errors are logged by the loader; the previous configuration stays
        let _ = loader.reload_async().await;
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_loader: Arc<ConfigLoader>) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Labels, MetricSample};
    use crate::notify::{DispatcherConfig, StaticSecretStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::util::ServiceExt;

    const RULES: &str = r#"
rules:
  - name: HighCpu
    expr: cpu_usage > 90
route:
  receivers: [default]
receivers:
  - name: default
    type: log
"#;

    struct TestApp {
        router: Router,
        state: Arc<AppState>,
        eval_loop: EvaluationLoop,
        _dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    fn create_test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yml");
        std::fs::write(&path, RULES).unwrap();

        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(SeriesStore::new());
        let loader = Arc::new(
            ConfigLoader::init(
                &path,
                Arc::new(StaticSecretStore::new()),
                Duration::from_secs(5),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let deliveries = Arc::new(DeliveryLog::default());
        let (dispatcher, dispatch) = Dispatcher::new(
            DispatcherConfig::default(),
            Arc::clone(&metrics),
            Arc::clone(&deliveries),
        );
        let (eval_loop, alerts) = EvaluationLoop::new(
            Arc::clone(&store),
            loader.subscribe(),
            dispatch,
            Arc::clone(&metrics),
            Duration::from_secs(15),
        );

        let state = Arc::new(AppState {
            store,
            loader,
            alerts,
            deliveries,
            metrics,
            started_at: 0,
        });

        TestApp {
            router: build_router(Arc::clone(&state)),
            state,
            eval_loop,
            _dispatcher: dispatcher,
            _dir: dir,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_text_and_json() {
        let app = create_test_app();

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("content-type", "text/plain")
                    .body(Body::from("cpu_usage{host=\"web-1\"} 95 1000\ncpu_usage{host=\"web-2\"} 20 1000\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["inserted"], 2);

        let batch = serde_json::json!({
            "samples": [
                {"name": "cpu_usage", "labels": {"host": "web-1"}, "value": 97, "timestamp": 2000},
                {"name": "bad name", "value": 1}
            ]
        });
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&batch).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["inserted"], 1);
        assert_eq!(body["errors"], 1);
        assert_eq!(app.state.store.stats().samples, 3);
    }

    #[tokio::test]
    async fn test_malformed_exposition_rejected() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .body(Body::from("cpu_usage 95\ncpu_usage{host=\"x\" 1\n"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.state.store.stats().samples, 0);
    }

    #[tokio::test]
    async fn test_alerts_after_tick() {
        let mut app = create_test_app();
        app.state
            .store
            .insert(MetricSample::new(
                "cpu_usage",
                Labels::from_pairs([("host", "web-1")]),
                99.0,
                1_000,
            ))
            .unwrap();
        app.eval_loop.tick(2_000);

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/alerts?state=firing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["alerts"][0]["labels"]["alertname"], "HighCpu");
        assert_eq!(body["alerts"][0]["state"], "firing");

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("klaxon_alerts_firing 1\n"));
        assert!(text.contains("klaxon_evaluation_ticks_total 1\n"));
    }

    #[tokio::test]
    async fn test_reload_endpoint() {
        let app = create_test_app();
        let path = app.state.loader.path().to_path_buf();

        std::fs::write(&path, RULES.replace("cpu_usage > 90", "cpu_usage >")).unwrap();
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/-/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        std::fs::write(&path, RULES.replace("HighCpu", "VeryHighCpu")).unwrap();
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/-/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router
            .oneshot(Request::builder().uri("/rules").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["rules"][0]["name"], "VeryHighCpu");
        assert_eq!(body["rules"][0]["expr"], "cpu_usage > 90");
        assert_eq!(body["receivers"][0], "default");
    }

    #[tokio::test]
    async fn test_deliveries_empty() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/deliveries?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["deliveries"], serde_json::json!([]));
    }
}
