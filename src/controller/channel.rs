//! The task channel between the controller and the executors running on the client sites.
//!
//! The transport of this channel is not part of this crate: a deployment plugs its own
//! [`TaskChannel`] in. [`LocalChannel`] routes tasks to executors living in the same process,
//! which is what simulations and tests use.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    common::{ClientName, FlContext, Payload},
    controller::task::Task,
};

/// Error reported by the executor side of a task exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("client {0} is not reachable")]
    Unreachable(ClientName),
    #[error("client rejected task {task}: {reason}")]
    Rejected { task: String, reason: String },
    #[error("task execution failed: {0}")]
    Execution(String),
}

/// Sends tasks to clients and waits for their reply.
///
/// The controller is the only issuer and the executors are the only responders. Timeouts are
/// enforced by the caller, an implementation may block for as long as the client takes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskChannel: Send + Sync {
    async fn send(
        &self,
        ctx: &FlContext,
        client: &ClientName,
        task: &Task,
    ) -> Result<Payload, ExecutorError>;
}

/// The client side of a task exchange.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &FlContext, task: &Task) -> Result<Payload, ExecutorError>;
}

/// A [`TaskChannel`] delivering tasks to executors of the same process.
#[derive(Default, Clone)]
pub struct LocalChannel {
    executors: HashMap<ClientName, Arc<dyn Executor>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an executor to a site, replacing any previous assignment.
    pub fn with_executor(mut self, client: impl Into<ClientName>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(client.into(), executor);
        self
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientName> {
        self.executors.keys()
    }
}

#[async_trait]
impl TaskChannel for LocalChannel {
    async fn send(
        &self,
        ctx: &FlContext,
        client: &ClientName,
        task: &Task,
    ) -> Result<Payload, ExecutorError> {
        let executor = self
            .executors
            .get(client)
            .ok_or_else(|| ExecutorError::Unreachable(client.clone()))?;
        debug!(client = %client, task = task.name(), "delivering task locally");
        executor.execute(ctx, task).await
    }
}
