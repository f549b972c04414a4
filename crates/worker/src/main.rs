use taskflow::api;
use taskflow::config::{self, Config};
use taskflow::content::{LogMailer, PgContentStore, Services};
use taskflow::db;
use taskflow::telemetry;

use taskflow::tasks::{
    Dispatcher, PayloadGuard, PgQueueBackend, PgTaskStore, QueueRepo, TaskRegistry, TaskRunner,
    TaskStore,
};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(telemetry::DEFAULT_FILTER);
    let cfg = config::Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        lease_seconds = cfg.lease_seconds,
        max_concurrency = cfg.max_concurrency,
        reap_interval_ms = cfg.reap_interval_ms,
        api = %cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        diagnostic_tasks = cfg.diagnostic_tasks,
        "taskflow worker starting"
    );

    let pool = db::connect(&cfg).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));
    let services = Services::new(
        Arc::new(PgContentStore::new(pool.clone())),
        Arc::new(LogMailer),
        cfg.exports_dir.clone(),
    );
    let runner = TaskRunner::new(store.clone(), services);
    let queue_repo = QueueRepo::new(pool.clone());
    let backend = PgQueueBackend::new(
        queue_repo.clone(),
        cfg.queue.clone(),
        PayloadGuard::new(cfg.max_payload_bytes),
        runner.clone(),
    );
    let registry = TaskRegistry::from_flag(cfg.diagnostic_tasks);
    tracing::info!(
        task_types = ?registry.task_types().iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        "task registry loaded"
    );
    let dispatcher = Dispatcher::new(
        registry,
        store,
        Arc::new(backend),
    );

    // ---- API task ----
    let app = api::router(api::ApiState::new(dispatcher));
    let api_addr = cfg.admin_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker loop task ----
    let worker_handle = tokio::spawn(worker_loop(queue_repo, runner, cfg));

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res??,
    }

    Ok(())
}

async fn worker_loop(queue: QueueRepo, runner: TaskRunner, cfg: Config) -> anyhow::Result<()> {
    let reap_interval = Duration::from_millis(cfg.reap_interval_ms);
    let permits = Arc::new(Semaphore::new(cfg.max_concurrency));
    let mut in_flight = JoinSet::new();
    let mut last_reap_at: Option<Instant> = None;

    loop {
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "job task aborted");
            }
        }

        // reclaim jobs from dead workers on a fixed interval
        if last_reap_at.map_or(true, |t| t.elapsed() >= reap_interval) {
            let reaped = queue.reap_expired_locks().await?;
            last_reap_at = Some(Instant::now());
            if reaped > 0 {
                tracing::info!(worker_id = %cfg.worker_id, reaped, "reaped expired leases");
            }
        }

        let permit = permits.clone().acquire_owned().await?;
        let leased = queue
            .lease_one_job(&cfg.queue, &cfg.worker_id, cfg.lease_seconds)
            .await?;
        let Some(job) = leased else {
            drop(permit);
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        };

        let queue = queue.clone();
        let runner = runner.clone();
        let worker_id = cfg.worker_id.clone();
        let lease_seconds = cfg.lease_seconds;
        in_flight.spawn(async move {
            let _permit = permit;
            queue.run_leased(&runner, &worker_id, lease_seconds, job).await;
        });
    }
}
