use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use record::{BackoffPolicy, Payload, RetryPolicy};

use crate::{Result, TaskError, TaskHandler};

/// A handler with its parameter and output types erased to [`Payload`].
#[async_trait]
pub(crate) trait ErasedTaskHandler: Send + Sync {
    fn retry_policy(&self) -> Option<RetryPolicy>;

    /// Decodes the parameter, runs the handler and its callbacks, and encodes
    /// the output. Errors are flattened to a message for `last_error`.
    async fn execute(&self, param: &Payload) -> std::result::Result<Payload, String>;
}

struct Erased<H>(H);

#[async_trait]
impl<H: TaskHandler> ErasedTaskHandler for Erased<H> {
    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.0.retry_policy()
    }

    async fn execute(&self, param: &Payload) -> std::result::Result<Payload, String> {
        let param: H::Param = param.decode().map_err(|e| e.to_string())?;

        match self.0.process(&param).await {
            Ok(output) => {
                let encoded = Payload::encode(&output).map_err(|e| e.to_string())?;
                self.0.on_success(&param, &output).await;
                Ok(encoded)
            }
            Err(e) => {
                self.0.on_fail(&param, &e).await;
                Err(e.to_string())
            }
        }
    }
}

/// Task handlers by kind.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedTaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `H::KIND`.
    pub fn register<H: TaskHandler>(&mut self, handler: H) -> Result<()> {
        if self.handlers.contains_key(H::KIND) {
            return Err(TaskError::DuplicateKind(H::KIND.to_string()));
        }
        self.handlers.insert(H::KIND, Arc::new(Erased(handler)));
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }

    /// The handler's own retry policy, if it declares one.
    pub fn retry_policy(&self, kind: &str) -> Option<RetryPolicy> {
        self.handlers.get(kind).and_then(|h| h.retry_policy())
    }

    /// Backoff used between attempts of `kind`.
    pub fn backoff(&self, kind: &str) -> BackoffPolicy {
        self.retry_policy(kind)
            .map(|p| p.backoff)
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, kind: &str) -> Option<Arc<dyn ErasedTaskHandler>> {
        self.handlers.get(kind).cloned()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
