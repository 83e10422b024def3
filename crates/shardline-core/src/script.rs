//! Pluggable script evaluation.
//!
//! The fabric ships script strings to a remote and awaits a result; it
//! never interprets them. `ScriptHost` is the seam where the embedding
//! application decides what a script string means. The shipped
//! implementation is `CommandHost`, a whitelist of named operations:
//! the script string is the operation id, the context is its argument
//! struct, and anything not registered is refused.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::envelope::RemoteError;

/// Evaluates a script string against a context, producing a result or
/// an error. Long scripts must be bounded by the caller's timeout.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn eval(&self, script: &str, context: Value) -> Result<Value, RemoteError>;
}

type CommandFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

/// Whitelist-only script host.
///
/// Operations are registered by name; evaluating an unregistered name
/// fails with an `InvalidScript` error instead of running anything.
#[derive(Default)]
pub struct CommandHost {
    commands: RwLock<HashMap<String, CommandFn>>,
}

impl CommandHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async operation under `op`.
    pub fn register<F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let wrapped: CommandFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.into(), wrapped);
    }

    /// Register a synchronous operation under `op`.
    pub fn register_fn<F>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(op, move |ctx| {
            let handler = handler.clone();
            async move { handler(ctx) }
        });
    }

    fn lookup(&self, op: &str) -> Option<CommandFn> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(op)
            .cloned()
    }
}

#[async_trait]
impl ScriptHost for CommandHost {
    async fn eval(&self, script: &str, context: Value) -> Result<Value, RemoteError> {
        match self.lookup(script) {
            Some(command) => command(context).await,
            None => Err(RemoteError::invalid_script(script)),
        }
    }
}
