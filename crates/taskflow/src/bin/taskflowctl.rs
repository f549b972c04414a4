use std::env;
use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use taskflow::content::{LogMailer, PgContentStore, Services};
use taskflow::handlers::Handler;
use taskflow::tasks::{
    Dispatcher, PayloadGuard, PgQueueBackend, PgTaskStore, QueueRepo, TaskArgs, TaskRegistry,
    TaskRunner, TaskStore,
};
use taskflow::{config, db, telemetry};

const USAGE: &str = "taskflowctl <command>\n\
Commands:\n\
- dispatch <task_type> <user_id> [args-json] [--sync]\n\
- show <task_id>\n\
- list <user_id> [limit]\n\
- enqueue <handler> [args-json]\n\
- add-user <email>\n\
- reset\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("taskflow=warn");

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    dotenvy::dotenv().ok();
    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;
    let cfg = config::Config::with_database_url(url);
    let pool = db::connect(&cfg).await?;

    match args[1].as_str() {
        "dispatch" => {
            let (task_type, user_id) = match (args.get(2), args.get(3)) {
                (Some(t), Some(u)) => (t.as_str(), u.parse::<Uuid>()?),
                _ => usage_error("dispatch <task_type> <user_id> [args-json] [--sync]"),
            };
            let synchronous = args.iter().any(|a| a == "--sync");
            let task_args = parse_args(args.iter().skip(4).find(|a| *a != "--sync"))?;
            dispatch(&pool, &cfg, task_type, user_id, task_args, synchronous).await?;
        }
        "show" => {
            let Some(id) = args.get(2) else {
                usage_error("show <task_id>")
            };
            show(&pool, id.parse()?).await?;
        }
        "list" => {
            let Some(id) = args.get(2) else {
                usage_error("list <user_id> [limit]")
            };
            let limit: i64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(20);
            list(&pool, id.parse()?, limit).await?;
        }
        "enqueue" => {
            let Some(name) = args.get(2) else {
                usage_error("enqueue <handler> [args-json]")
            };
            let handler = Handler::parse(name)
                .ok_or_else(|| anyhow::anyhow!("unknown handler: {name}"))?;
            enqueue(&pool, &cfg, handler, parse_args(args.get(3))?).await?;
        }
        "add-user" => {
            let Some(email) = args.get(2) else {
                usage_error("add-user <email>")
            };
            add_user(&pool, email).await?;
        }
        "reset" => reset(&pool).await?,
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn usage_error(usage: &str) -> ! {
    eprintln!("usage: taskflowctl {usage}");
    std::process::exit(2);
}

fn parse_args(raw: Option<&String>) -> anyhow::Result<TaskArgs> {
    match raw {
        None => Ok(TaskArgs::new()),
        Some(s) => match serde_json::from_str::<Value>(s)? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("args must be a JSON object"),
        },
    }
}

fn dispatcher(pool: &PgPool, cfg: &config::Config) -> Dispatcher {
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));
    let services = Services::new(
        Arc::new(PgContentStore::new(pool.clone())),
        Arc::new(LogMailer),
        cfg.exports_dir.clone(),
    );
    let runner = TaskRunner::new(store.clone(), services);
    let backend = PgQueueBackend::new(
        QueueRepo::new(pool.clone()),
        cfg.queue.clone(),
        PayloadGuard::new(cfg.max_payload_bytes),
        runner,
    );
    Dispatcher::new(
        TaskRegistry::from_flag(cfg.diagnostic_tasks),
        store,
        Arc::new(backend),
    )
}

async fn dispatch(
    pool: &PgPool,
    cfg: &config::Config,
    task_type: &str,
    user_id: Uuid,
    args: TaskArgs,
    synchronous: bool,
) -> anyhow::Result<()> {
    let dispatched = dispatcher(pool, cfg)
        .create_task_for(task_type, Some(user_id), args, synchronous)
        .await?;
    println!("{}", serde_json::to_string_pretty(&dispatched)?);
    Ok(())
}

async fn enqueue(
    pool: &PgPool,
    cfg: &config::Config,
    handler: Handler,
    args: TaskArgs,
) -> anyhow::Result<()> {
    let handle = dispatcher(pool, cfg).enqueue_untracked(handler, None, args).await;
    println!("{}", serde_json::to_string_pretty(&handle)?);
    Ok(())
}

async fn show(pool: &PgPool, task_id: Uuid) -> anyhow::Result<()> {
    match PgTaskStore::new(pool.clone()).get(task_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => {
            eprintln!("task {task_id} not found");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn list(pool: &PgPool, user_id: Uuid, limit: i64) -> anyhow::Result<()> {
    let records = PgTaskStore::new(pool.clone())
        .list_for_user(user_id, limit)
        .await?;
    for r in records {
        let progress = r
            .progress
            .map(|p| format!("{p:.0}%"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<18} {:<8} {:>5}  {}",
            r.task_id,
            r.task_type.as_str(),
            r.status.as_str(),
            progress,
            r.metadata.error_message().unwrap_or("")
        );
    }
    Ok(())
}

async fn add_user(pool: &PgPool, email: &str) -> anyhow::Result<()> {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO users (id, email)
        VALUES ($1, $2)
        ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .fetch_one(pool)
    .await?;

    println!("{id}");
    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            task_queue,
            tasks,
            metadata_cache
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}
