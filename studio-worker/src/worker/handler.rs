//! Job handlers and the registry that maps job types to them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::queue::{Job, JobType};

/// Executes jobs of one type. Opaque to the engine beyond success or failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Adapts an async closure taking an owned [`Job`].
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> BoxedHandlerFuture + Send + Sync,
{
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        (self.f)(job.clone()).await
    }
}

/// Job type → handler mapping.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        if self.handlers.insert(job_type, handler).is_some() {
            warn!(job_type = %job_type, "Replacing existing job handler");
        }
        self
    }

    /// Register an async closure as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, f: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = FnHandler {
            f: move |job: Job| -> BoxedHandlerFuture { Box::pin(f(job)) },
        };
        self.register(job_type, Arc::new(handler))
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Registered job types in poll order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build a registry of [`CommandHandler`]s from `JOB_HANDLER_<TYPE>`
    /// environment variables, e.g. `JOB_HANDLER_GENERATE_PODCAST`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut registry = Self::new();
        for job_type in JobType::ALL {
            let key = format!("JOB_HANDLER_{}", job_type.env_key());
            let Some(command) = lookup(&key).filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            info!(job_type = %job_type, command = %command, "Registered command handler");
            registry.register(job_type, Arc::new(CommandHandler::new(command)));
        }
        registry
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

/// Maximum number of stderr lines carried into a job's error message.
const STDERR_TAIL_LINES: usize = 20;

/// Runs a shell command per job.
///
/// The job is written to the command's stdin as JSON. Stdout is parsed as the
/// JSON result; anything that is not JSON is wrapped as `{"output": "..."}`.
/// A non-zero exit fails the job with the tail of stderr.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, job: &Job) -> anyhow::Result<std::process::Output> {
        let mut cmd = process_utils::shell_command(&self.command);
        cmd.env("JOB_ID", &job.id)
            .env("JOB_TYPE", job.job_type.as_str())
            .env("JOB_USER_ID", job.user_id());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn command '{}': {}", self.command, e))?;

        // Feed stdin from its own task so a chatty child cannot deadlock on a
        // full stdout pipe while we are still writing.
        let input = serde_json::to_vec(job)?;
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Command closed stdin early");
                }
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        Ok(output)
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        debug!(job_id = %job.id, command = %self.command, "Executing job command");

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(job))
                .await
                .map_err(|_| anyhow::anyhow!("command timed out after {:?}", limit))??,
            None => self.run(job).await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_lines(&stderr, STDERR_TAIL_LINES);
            if tail.is_empty() {
                anyhow::bail!("command exited with {}", output.status);
            }
            anyhow::bail!("command exited with {}: {}", output.status, tail);
        }

        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::json!({ "output": trimmed }))
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
