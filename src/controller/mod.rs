//! Server-side workflow drivers.
//!
//! A [`Controller`] coordinates a fixed roster of clients through four phases:
//!
//! 1. `configure`: send the workflow configuration to the clients;
//! 2. `start`: tell the clients to begin;
//! 3. `monitor`: drive or watch the work until it completes or a timeout fires;
//! 4. `finalize`: release whatever the previous phases acquired.
//!
//! The phases are run by [`crate::job::Job`]. Two workflows are provided: the round-robin
//! [`cyclic::CyclicController`] and the [`bridge::BridgeController`], which hands the per-round
//! work to an external aggregation engine through an [`crate::adaptor::Adaptor`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    adaptor::AdaptorError,
    common::{ClientName, FlContext},
    controller::{persistor::PersistorError, task::{ClientTask, TaskState}},
};

pub mod bridge;
pub mod channel;
pub mod cyclic;
pub mod dispatcher;
pub mod monitor;
pub mod persistor;
pub mod task;

pub use self::{
    bridge::{AdaptorFactory, BridgeController, BridgeControllerConfig, BridgeSetup},
    channel::{Executor, ExecutorError, LocalChannel, TaskChannel},
    cyclic::{CyclicConfig, CyclicController, Dispatch, RelayOrder},
    dispatcher::{ClientActivity, Dispatcher},
    monitor::{CompletionProbe, Monitor, MonitorConfig},
    task::Task,
};

/// Errors that end a workflow.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid roster: {0}")]
    InvalidRoster(String),

    #[error("task {task} failed on client {client}: {cause}")]
    Broadcast {
        task: String,
        client: ClientName,
        cause: String,
    },

    #[error("task {task} {state} on client {client}: {cause}")]
    Task {
        task: String,
        client: ClientName,
        state: TaskState,
        cause: String,
    },

    #[error("relay failed in round {round} at client {client}: {cause}")]
    RelayFailed {
        round: u32,
        client: ClientName,
        cause: String,
    },

    #[error("client {client} silent for {silent_for:?}")]
    ClientSilent {
        client: ClientName,
        silent_for: Duration,
    },

    #[error("job not done after {elapsed:?} (limit {limit:?})")]
    ProgressTimeout { elapsed: Duration, limit: Duration },

    #[error("bridge server crashed: {0}")]
    BridgeCrashed(String),

    #[error("adaptor error: {0}")]
    Adaptor(#[from] AdaptorError),

    #[error("artifact persistence failed: {0}")]
    Persistor(#[from] PersistorError),

    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ControllerError {
    pub(crate) fn task_failed(record: &ClientTask) -> Self {
        ControllerError::Task {
            task: record.task_name.clone(),
            client: record.client.clone(),
            state: record.state,
            cause: record
                .error
                .clone()
                .unwrap_or_else(|| "no result".to_string()),
        }
    }
}

/// The phases a workflow goes through. See the [module level documentation](self).
#[async_trait]
pub trait Controller: Send {
    fn name(&self) -> &str;

    async fn configure(&mut self, ctx: &FlContext) -> Result<(), ControllerError>;

    async fn start(&mut self, ctx: &FlContext) -> Result<(), ControllerError>;

    async fn monitor(&mut self, ctx: &FlContext) -> Result<(), ControllerError>;

    /// Called once at the end, whether the other phases succeeded or not.
    async fn finalize(&mut self, ctx: &FlContext) -> Result<(), ControllerError>;
}
