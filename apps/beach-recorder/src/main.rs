use std::sync::Arc;

use axum::Router;
use beach_recorder::config::RecorderConfig;
use beach_recorder::engine::Engine;
use beach_recorder::router::MessageRouter;
use beach_recorder::routes::{self, AppState};
use beach_recorder::telemetry::init_tracing;
use recorder_sdk::RecorderClient;
use recorder_sdk::kv_store::{FileKvStore, KvStore, MemoryKvStore};
use tracing::info;

#[tokio::main]
async fn main() {
    let cfg = RecorderConfig::from_env();
    init_tracing(&cfg.log_filter);

    let persistent: Arc<dyn KvStore> = FileKvStore::new(&cfg.persistent_store_path);
    let session_scoped: Arc<dyn KvStore> = match &cfg.session_store_path {
        Some(path) => FileKvStore::new(path),
        None => MemoryKvStore::new(),
    };
    let api = Arc::new(RecorderClient::new(cfg.api_base.clone()));
    let engine = Engine::new(api, persistent, session_scoped, cfg.engine.clone());
    engine.ready().await;

    let app: Router = routes::router(AppState::new(MessageRouter::new(engine)));

    info!(
        addr = %cfg.bind_addr,
        api_base = %cfg.api_base,
        store = %cfg.persistent_store_path.display(),
        session_store = %cfg
            .session_store_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".into()),
        autosave_debounce_ms = cfg.engine.autosave_debounce.as_millis() as u64,
        autosave_max_age_ms = cfg.engine.autosave_max_age.as_millis() as u64,
        max_retries = cfg.engine.max_retries,
        callout_poll_ms = cfg.engine.callout_poll_interval.as_millis() as u64,
        "starting beach-recorder"
    );
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .expect("bind");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server");
}
