//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() の最初に ForemanConfig::validate() を呼ぶ
//! - ストアを開けなければその場で BuildError
//! - 差し替えたい port（store / clock / event sink / ...）だけ with_* で渡す

use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::enqueue::Enqueuer;
use super::ingest::IngestService;
use super::lease::LeaseManager;
use super::reclaimer::{Reclaimer, ReclaimerLoop};
use super::remediation::Remediation;
use super::status::StatusView;
use super::worker_loop::{TaskHandler, WorkerGroup};
use crate::config::{ConfigError, ForemanConfig};
use crate::domain::QueueError;
use crate::impls::{InMemoryIngestor, InMemoryTaskStore, StaticTokenAuthenticator, TracingEventSink};
use crate::ports::{
    Authenticator, BatchIngestor, Clock, EventSink, IdGenerator, SystemClock, TaskStore,
    UlidGenerator,
};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(ForemanConfig::load("foreman.toml")?)
///     .with_event_sink(Arc::new(MemoryEventSink::new()))
///     .build()?;
/// ```
pub struct AppBuilder {
    config: ForemanConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    ids: Option<Arc<dyn IdGenerator>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    ingestor: Option<Arc<dyn BatchIngestor>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(QueueError),
}

impl AppBuilder {
    pub fn new(config: ForemanConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            events: None,
            ids: None,
            authenticator: None,
            ingestor: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_ingestor(mut self, ingestor: Arc<dyn BatchIngestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        let lease_duration = config.lease_duration();
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            lease_duration,
            config.dispatch.max_batch,
        ));
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            config.retry_policy(),
            lease_duration,
        ));
        let reclaimer = Arc::new(Reclaimer::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            config.reclaim.batch_size,
        ));
        let status = StatusView::new(store.clone(), clock.clone());
        let remediation = Remediation::new(store.clone(), reclaimer.clone(), dispatcher.clone());
        let enqueuer = Enqueuer::new(
            store.clone(),
            clock.clone(),
            ids.clone(),
            config.dispatch.default_max_attempts,
        );
        let authenticator = self.authenticator.unwrap_or_else(|| {
            Arc::new(StaticTokenAuthenticator::new(config.ingest.tokens.clone()))
        });
        let ingestor = self
            .ingestor
            .unwrap_or_else(|| Arc::new(InMemoryIngestor::new()));
        let ingest = IngestService::new(authenticator, ingestor);

        Ok(App {
            config,
            store,
            clock,
            events,
            ids,
            dispatcher,
            leases,
            reclaimer,
            status,
            remediation,
            enqueuer,
            ingest,
        })
    }
}

fn open_store(config: &ForemanConfig) -> Result<Arc<dyn TaskStore>, BuildError> {
    match config.store.sqlite_path.as_deref() {
        None => Ok(Arc::new(InMemoryTaskStore::new())),
        #[cfg(feature = "sqlite")]
        Some(path) => {
            let store = crate::impls::SqliteTaskStore::open(path).map_err(BuildError::Store)?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(BuildError::Config(ConfigError::Invalid(format!(
            "store.sqlite_path = {path:?} but foreman-core was built without the `sqlite` feature"
        )))),
    }
}

/// Wired application: every service shares one store, clock and event sink.
pub struct App {
    pub config: ForemanConfig,
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
    pub ids: Arc<dyn IdGenerator>,
    pub dispatcher: Arc<Dispatcher>,
    pub leases: Arc<LeaseManager>,
    pub reclaimer: Arc<Reclaimer>,
    pub status: StatusView,
    pub remediation: Remediation,
    pub enqueuer: Enqueuer,
    pub ingest: IngestService,
}

impl App {
    /// `worker.concurrency` workers sharing `handler`.
    pub fn spawn_workers(&self, handler: Arc<dyn TaskHandler>) -> WorkerGroup {
        WorkerGroup::spawn(
            self.config.worker.concurrency,
            self.ids.as_ref(),
            self.dispatcher.clone(),
            self.leases.clone(),
            handler,
            self.config.worker_settings(),
        )
    }

    pub fn reclaimer_loop(&self) -> ReclaimerLoop {
        ReclaimerLoop::new(self.reclaimer.clone(), self.config.reclaim_interval())
    }
}
