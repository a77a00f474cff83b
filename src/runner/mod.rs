//! The aggregation engine behind the bridge.
//!
//! The bridge server forwards every aggregation request it receives to a [`Runner`]. A real
//! deployment plugs the engine of the external training job in here; [`mock::MockRunner`] echoes
//! requests back and is used to check the bridge itself.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{FlContext, Rank};

pub mod mock;

/// The collective operation a client asks the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum CollectiveOp {
    #[display(fmt = "allgather")]
    Allgather,
    #[display(fmt = "allgather_v")]
    AllgatherV,
    #[display(fmt = "allreduce")]
    Allreduce,
    #[display(fmt = "broadcast(root={})", root)]
    Broadcast { root: Rank },
}

/// A request of one rank. The buffer is opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub op: CollectiveOp,
    pub sequence_number: u64,
    pub send_buffer: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReply {
    pub sequence_number: u64,
    pub receive_buffer: Bytes,
}

/// Parameters of the training job a runner is initialized with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub num_rounds: u32,
    pub world_size: u32,
    pub split_mode: u32,
    pub secure_training: bool,
    /// Engine specific parameters, forwarded untouched.
    pub params: serde_json::Value,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner used before initialization")]
    NotInitialized,
    #[error("unsupported operation {0}")]
    Unsupported(CollectiveOp),
    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

/// An aggregation strategy.
///
/// A runner is initialized once, then shared by every connection of the bridge for the duration
/// of the job, so `aggregate` may be called concurrently for different ranks.
#[async_trait]
pub trait Runner: Send + Sync {
    fn initialize(&mut self, ctx: &FlContext, params: &TrainingParams) -> Result<(), RunnerError>;

    /// Upper bound of a single `aggregate` call. The bridge enforces it.
    fn aggr_timeout(&self) -> Duration;

    async fn aggregate(
        &self,
        rank: Rank,
        request: AggregationRequest,
    ) -> Result<AggregationReply, RunnerError>;
}
