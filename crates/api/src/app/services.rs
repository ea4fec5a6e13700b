//! Service wiring: stores, collaborators, and the background loops.
//!
//! With `DATABASE_URL` set, tasks, call records and contacts live in
//! Postgres. Without it everything is in-process, which is what tests and
//! local development use. The job queue is always in-process.

use std::sync::Arc;

use dialback_infra::Settings;
use dialback_infra::call_store::{CallStore, InMemoryCallStore, PostgresCallStore};
use dialback_infra::db;
use dialback_infra::dispatcher::{Dispatcher, DispatcherHandle};
use dialback_infra::external::{
    Analysis, ContactDirectory, ConversationFetcher, Dialer, ExternalError, HttpAnalysis, HttpConversationFetcher,
    HttpDialer, InMemoryContactDirectory, LoggingAnalysis, PostgresContactDirectory, ScriptedDialer,
    StaticConversationFetcher,
};
use dialback_infra::jobs::{
    InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobKind, JobStore,
};
use dialback_infra::reconciler::{AnalyzeCallHandler, WebhookReconciler};
use dialback_infra::task_store::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use dialback_infra::worker::ExecutionWorker;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("database setup failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("collaborator setup failed: {0}")]
    Collaborator(#[from] ExternalError),
}

/// Everything the HTTP handlers and background loops share.
pub struct AppServices {
    pub settings: Settings,
    pub tasks: Arc<dyn TaskStore>,
    pub calls: Arc<dyn CallStore>,
    pub jobs: Arc<dyn JobStore>,
    pub worker: Arc<ExecutionWorker>,
    pub reconciler: Arc<WebhookReconciler>,
    pub dispatcher: Arc<Dispatcher>,
    analysis: Arc<dyn Analysis>,
    fetch_enabled: bool,
}

/// Direct handles to the in-process collaborators, for seeding contacts and
/// scripting the dialer in tests.
#[derive(Clone)]
pub struct InMemoryHandles {
    pub tasks: Arc<InMemoryTaskStore>,
    pub calls: Arc<InMemoryCallStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub contacts: Arc<InMemoryContactDirectory>,
    pub dialer: Arc<ScriptedDialer>,
    pub fetcher: Arc<StaticConversationFetcher>,
    pub analysis: Arc<LoggingAnalysis>,
}

struct Collaborators {
    contacts: Arc<dyn ContactDirectory>,
    dialer: Arc<dyn Dialer>,
    fetcher: Option<Arc<dyn ConversationFetcher>>,
    analysis: Arc<dyn Analysis>,
}

/// Build services from settings: Postgres when `DATABASE_URL` is set,
/// HTTP collaborators for every configured URL.
pub async fn build_services(settings: Settings) -> Result<AppServices, ServiceError> {
    let timeout = settings.http_timeout();

    let dialer: Arc<dyn Dialer> = match settings.dialer_url.as_deref() {
        Some(url) => Arc::new(HttpDialer::new(url, settings.dialer_api_key.clone(), timeout)?),
        None => {
            tracing::warn!("DIALER_URL not set; calls are simulated and always succeed");
            Arc::new(ScriptedDialer::new())
        }
    };
    let fetcher: Option<Arc<dyn ConversationFetcher>> = match settings.provider_api_url.as_deref() {
        Some(url) => Some(Arc::new(HttpConversationFetcher::new(
            url,
            settings.provider_api_key.clone(),
            timeout,
        )?)),
        None => None,
    };
    let analysis: Arc<dyn Analysis> = match settings.analysis_url.as_deref() {
        Some(url) => Arc::new(HttpAnalysis::new(url, timeout)?),
        None => Arc::new(LoggingAnalysis::new()),
    };

    let jobs: Arc<dyn JobStore> = InMemoryJobStore::arc();

    match settings.database_url.clone() {
        Some(database_url) => {
            let pool = db::connect(&database_url, (settings.worker_count as u32 + 2).max(5)).await?;
            db::migrate(&pool).await?;

            let collaborators = Collaborators {
                contacts: Arc::new(PostgresContactDirectory::new(pool.clone())),
                dialer,
                fetcher,
                analysis,
            };
            Ok(AppServices::assemble(
                settings,
                Arc::new(PostgresTaskStore::new(pool.clone())),
                Arc::new(PostgresCallStore::new(pool)),
                jobs,
                collaborators,
            ))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            let collaborators = Collaborators {
                contacts: Arc::new(InMemoryContactDirectory::new()),
                dialer,
                fetcher,
                analysis,
            };
            Ok(AppServices::assemble(
                settings,
                InMemoryTaskStore::arc(),
                InMemoryCallStore::arc(),
                jobs,
                collaborators,
            ))
        }
    }
}

/// Fully in-process services plus handles to every collaborator.
pub fn in_memory(settings: Settings) -> (AppServices, InMemoryHandles) {
    let handles = InMemoryHandles {
        tasks: InMemoryTaskStore::arc(),
        calls: InMemoryCallStore::arc(),
        jobs: InMemoryJobStore::arc(),
        contacts: Arc::new(InMemoryContactDirectory::new()),
        dialer: Arc::new(ScriptedDialer::new()),
        fetcher: Arc::new(StaticConversationFetcher::new()),
        analysis: Arc::new(LoggingAnalysis::new()),
    };
    let collaborators = Collaborators {
        contacts: handles.contacts.clone(),
        dialer: handles.dialer.clone(),
        fetcher: Some(handles.fetcher.clone()),
        analysis: handles.analysis.clone(),
    };
    let services = AppServices::assemble(
        settings,
        handles.tasks.clone(),
        handles.calls.clone(),
        handles.jobs.clone(),
        collaborators,
    );
    (services, handles)
}

impl AppServices {
    fn assemble(
        settings: Settings,
        tasks: Arc<dyn TaskStore>,
        calls: Arc<dyn CallStore>,
        jobs: Arc<dyn JobStore>,
        collaborators: Collaborators,
    ) -> Self {
        let worker = Arc::new(ExecutionWorker::new(
            tasks.clone(),
            calls.clone(),
            collaborators.contacts,
            collaborators.dialer,
            jobs.clone(),
            settings.dial_retry_policy(),
        ));

        let mut reconciler = WebhookReconciler::new(
            calls.clone(),
            jobs.clone(),
            settings.webhook_secret.clone(),
            settings.metadata_scan_window(),
        );
        let fetch_enabled = collaborators.fetcher.is_some();
        if let Some(fetcher) = collaborators.fetcher {
            reconciler = reconciler.with_fetcher(fetcher);
        }

        let dispatcher = Arc::new(
            Dispatcher::new(tasks.clone(), jobs.clone(), settings.dispatch_batch_size)
                .with_claim_timeout(settings.claim_timeout()),
        );

        Self {
            settings,
            tasks,
            calls,
            jobs,
            worker,
            reconciler: Arc::new(reconciler),
            dispatcher,
            analysis: collaborators.analysis,
            fetch_enabled,
        }
    }

    /// Job executor with a handler for every job kind this service enqueues.
    pub fn executor(&self) -> JobExecutor<Arc<dyn JobStore>> {
        let mut executor = JobExecutor::new(self.jobs.clone());
        executor.register_shared(JobKind::EXECUTE_FOLLOW_UP, self.worker.clone());
        if self.fetch_enabled {
            executor.register_shared(JobKind::FETCH_CONVERSATION, self.reconciler.clone());
        }
        executor.register_handler(JobKind::ANALYZE_CALL, AnalyzeCallHandler::new(self.analysis.clone()));
        executor
    }

    /// Start the job workers and the dispatcher loop.
    pub fn spawn_background(&self) -> BackgroundHandles {
        let executor = self.executor().spawn(
            JobExecutorConfig::default()
                .with_name("dialback")
                .with_workers(self.settings.worker_count)
                .with_poll_interval(self.settings.job_poll_interval()),
        );
        let dispatcher = self.dispatcher.clone().spawn(self.settings.dispatch_interval());
        BackgroundHandles { executor, dispatcher }
    }
}

pub struct BackgroundHandles {
    executor: JobExecutorHandle,
    dispatcher: DispatcherHandle,
}

impl BackgroundHandles {
    /// Stop the dispatcher first so no new work arrives, then the workers.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        self.executor.shutdown().await;
    }
}
