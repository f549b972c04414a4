//! Synthetic jobs for exercising the dispatcher without domain state.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{HandlerError, TaskContext, TaskResult};
use crate::tasks::model::TaskArgs;

/// Hands its arguments back as the result.
pub async fn echo(args: TaskArgs) -> Result<Option<TaskResult>, HandlerError> {
    if args.is_empty() {
        return Ok(None);
    }
    Ok(Some(TaskResult::data(Value::Object(args))))
}

pub async fn always_fails() -> Result<(), HandlerError> {
    Err(HandlerError::Simulated("this job always fails".into()))
}

fn default_steps() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
pub struct ReportProgressArgs {
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default)]
    pub step_delay_ms: u64,
}

pub async fn report_progress(ctx: &TaskContext, args: ReportProgressArgs) -> Result<(), HandlerError> {
    if args.steps == 0 {
        return Err(HandlerError::BadArguments("steps must be positive".into()));
    }
    for step in 1..=args.steps {
        if args.step_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.step_delay_ms)).await;
        }
        ctx.report_progress(f64::from(step) * 100.0 / f64::from(args.steps))
            .await;
    }
    Ok(())
}
