//! Top-level process wiring: builds every subsystem from `Config` and
//! drives the HTTP listener plus the two background tasks (spec.md §5).

use std::sync::Arc;

use tracing::info;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::db::DatabaseManager;
use crate::ledger::CreditLedger;
use crate::lifecycle::LifecycleEngine;
use crate::provider::{HttpVoiceProviderAdapter, VoiceProviderAdapter};
use crate::queue::QueueProcessor;
use crate::reaper::StaleSlotReaper;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseManager,
    pub admission: AdmissionController,
    pub ledger: CreditLedger,
    pub lifecycle: LifecycleEngine,
    pub provider: Arc<dyn VoiceProviderAdapter>,
}

pub struct Server {
    config: Config,
    state: AppState,
    queue_processor: QueueProcessor,
    reaper: StaleSlotReaper,
}

impl Server {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db = DatabaseManager::new(&config.database_url).await?;
        let admission = AdmissionController::new(
            db.clone(),
            config.system_concurrent_calls_limit,
            config.default_user_concurrent_calls_limit as i32,
        );
        let ledger = CreditLedger::new(db.clone());
        let lifecycle = LifecycleEngine::new(db.clone(), admission.clone(), ledger.clone());
        let provider: Arc<dyn VoiceProviderAdapter> = Arc::new(HttpVoiceProviderAdapter::new(
            config.voice_provider_base_url.clone(),
            config.voice_provider_api_key.clone(),
            config.provider_api_timeout,
        )?);

        let queue_processor = QueueProcessor::new(
            db.clone(),
            admission.clone(),
            provider.clone(),
            config.queue_processor_interval,
            config.queue_retry_max_attempts,
        );
        let reaper =
            StaleSlotReaper::new(db.clone(), config.stale_slot_reaper_interval, config.max_call_duration);

        let state = AppState { db, admission, ledger, lifecycle, provider };
        Ok(Self { config, state, queue_processor, reaper })
    }

    /// Builds the axum app and runs it plus the background tasks until the
    /// process is killed.
    pub async fn run(self) -> anyhow::Result<()> {
        tokio::spawn(self.queue_processor.clone().run());
        tokio::spawn(self.reaper.clone().run());

        let app = crate::webhook::router(self.state.clone())
            .layer(tower_http::trace::TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(&self.config.http_bind_addr).await?;
        info!(addr = %self.config.http_bind_addr, "callctl listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
