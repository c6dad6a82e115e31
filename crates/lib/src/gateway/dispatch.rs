//! Dispatcher: named capability handlers, resolved and executed with latency accounting.
//!
//! A dispatch always ends in exactly one [`CommandResult`]: resolved, not found, timed out, or
//! failed. Handler errors and panics are contained here and never escape to the transports.

use crate::gateway::command::{Command, CommandResult, ErrorInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// What a handler produces: a JSON payload or an error.
pub type HandlerOutcome = Result<Value, HandlerError>;

/// Failure reported by a handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The command's parameters did not fit the handler's expected shape.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

impl From<HandlerError> for ErrorInfo {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::InvalidParams(_) => ErrorInfo::bad_input(e.to_string()),
            HandlerError::Failed(msg) => ErrorInfo::handler_failure(msg),
        }
    }
}

/// A named unit of behavior. Handlers should not block the runtime and should reach an await
/// point regularly so a timed-out dispatch can cancel them.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn execute(&self, command: &Command) -> HandlerOutcome;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler; the closure receives its own copy of the command.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn execute(&self, command: &Command) -> HandlerOutcome {
        (self.0)(command.clone()).await
    }
}

/// How long a handler may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// The dispatcher's configured default.
    #[default]
    Default,
    Fixed(Duration),
    /// Lightweight handlers that are never bounded.
    Unbounded,
}

impl TimeoutPolicy {
    fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            TimeoutPolicy::Default => Some(default),
            TimeoutPolicy::Fixed(d) => Some(d),
            TimeoutPolicy::Unbounded => None,
        }
    }
}

/// What to do when a name is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    Reject,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("handler already registered: {0}")]
    Conflict(String),
    #[error("handler name must not be empty")]
    EmptyName,
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn Handler>,
    timeout: TimeoutPolicy,
}

/// Handler table plus execution. Registration takes the write lock for a single insert, so a
/// dispatch sees either the old mapping or the new one.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Registration>>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register with the default timeout policy.
    pub fn register<H: Handler>(
        &self,
        name: impl Into<String>,
        handler: H,
        mode: RegisterMode,
    ) -> Result<(), RegistrationError> {
        self.register_with(name, Arc::new(handler), TimeoutPolicy::Default, mode)
    }

    pub fn register_with(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        timeout: TimeoutPolicy,
        mode: RegisterMode,
    ) -> Result<(), RegistrationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let mut g = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if mode == RegisterMode::Reject && g.contains_key(&name) {
            return Err(RegistrationError::Conflict(name));
        }
        if g.insert(name.clone(), Registration { handler, timeout }).is_some() {
            log::info!("handler overridden: {}", name);
        } else {
            log::debug!("handler registered: {}", name);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch using the handler's registered timeout policy.
    pub async fn dispatch(&self, command: Command) -> CommandResult {
        self.run(command, None).await
    }

    /// Dispatch with an explicit bound (`None` = unbounded), ignoring the registered policy.
    pub async fn dispatch_with_timeout(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> CommandResult {
        self.run(command, Some(timeout)).await
    }

    async fn run(&self, command: Command, bound_override: Option<Option<Duration>>) -> CommandResult {
        let name = command.name().to_string();
        let Some(registration) = self.lookup(&name) else {
            log::debug!("dispatch: no handler for {}", name);
            return CommandResult::err(
                ErrorInfo::not_found(format!("no handler registered for '{}'", name)),
                0,
            );
        };
        let bound = bound_override.unwrap_or_else(|| registration.timeout.resolve(self.default_timeout));

        let start = Instant::now();
        let handler = registration.handler;
        let mut task = tokio::spawn(async move { handler.execute(&command).await });

        let joined = match bound {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // First resolution wins: the late output of the aborted task is never read.
                    task.abort();
                    log::warn!("dispatch: {} timed out after {} ms", name, limit.as_millis());
                    return CommandResult::err(
                        ErrorInfo::timeout(format!(
                            "handler '{}' did not complete within {} ms",
                            name,
                            limit.as_millis()
                        )),
                        elapsed_millis(start),
                    );
                }
            },
            None => task.await,
        };

        let elapsed = elapsed_millis(start);
        match joined {
            Ok(Ok(payload)) => {
                log::debug!("dispatch: {} completed in {} ms", name, elapsed);
                CommandResult::ok(payload, elapsed)
            }
            Ok(Err(e)) => {
                log::debug!("dispatch: {} failed: {}", name, e);
                CommandResult::err(e.into(), elapsed)
            }
            Err(e) if e.is_panic() => {
                log::warn!("dispatch: handler {} panicked", name);
                CommandResult::err(ErrorInfo::handler_failure(format!("handler '{}' panicked", name)), elapsed)
            }
            Err(_) => CommandResult::err(ErrorInfo::internal(format!("handler '{}' was cancelled", name)), elapsed),
        }
    }

    fn lookup(&self, name: &str) -> Option<Registration> {
        self.read().get(name).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn elapsed_millis(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
