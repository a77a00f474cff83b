//! The RPC service the external aggregation clients talk to.

use std::sync::Arc;

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use tarpc::context;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    adaptor::{
        connections::{Connection, Connections, RankTable},
        AdaptorStatus,
    },
    common::{ClientName, Rank},
    controller::ClientActivity,
    runner::{AggregationReply, AggregationRequest, Runner},
};

#[tarpc::service]
pub trait Bridge {
    /// Bind the connection to the rank of `client`.
    async fn register(client: ClientName) -> Result<Rank, BridgeError>;
    /// Run one aggregation step for the rank of the connection.
    async fn aggregate(request: AggregationRequest) -> Result<AggregationReply, BridgeError>;
    /// Tell the bridge that the rank of the connection is done.
    async fn finish() -> Result<(), BridgeError>;
}

/// Errors returned to bridge clients.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    /// Client {0} is not part of this job.
    UnknownClient(ClientName),
    /// Rank {rank} is held by another connection.
    RankInUse { rank: Rank },
    /// The connection is already registered as rank {rank}.
    AlreadyRegistered { rank: Rank },
    /// The connection must register first.
    NotRegistered,
    /// Aggregation for rank {rank} did not complete within {timeout_ms}ms.
    Timeout { rank: Rank, timeout_ms: u64 },
    /// The bridge is shutting down.
    ShuttingDown,
    /// The runner failed: {0}.
    Runner(String),
}

impl BridgeError {
    /// Whether the same request may succeed if sent again on the same connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}

/// Everything the connections of one running bridge server share.
pub(crate) struct BridgeState {
    pub(crate) runner: Arc<dyn Runner>,
    pub(crate) ranks: RankTable,
    pub(crate) activity: ClientActivity,
    pub(crate) status: Arc<watch::Sender<AdaptorStatus>>,
    pub(crate) connections: Mutex<Connections>,
    /// Cancelled once a stop is requested: no new connections nor calls.
    pub(crate) shutdown: CancellationToken,
    /// Cancelled when the drain period is over: connections are dropped.
    pub(crate) force_close: CancellationToken,
    /// In-flight calls.
    pub(crate) calls: TaskTracker,
    /// Connection drivers.
    pub(crate) drivers: TaskTracker,
}

impl BridgeState {
    pub(crate) fn new(
        runner: Arc<dyn Runner>,
        ranks: RankTable,
        activity: ClientActivity,
        status: Arc<watch::Sender<AdaptorStatus>>,
    ) -> Self {
        Self {
            runner,
            ranks,
            activity,
            status,
            connections: Mutex::new(Connections::default()),
            shutdown: CancellationToken::new(),
            force_close: CancellationToken::new(),
            calls: TaskTracker::new(),
            drivers: TaskTracker::new(),
        }
    }

    /// Free the rank of a closed connection.
    pub(crate) async fn release(&self, conn: &Connection) {
        if let Some((rank, client)) = conn.identity() {
            if self.connections.lock().await.release(*rank, conn.id) {
                debug!(rank = %rank, client = %client, "rank released");
            }
        }
    }
}

/// Serves the calls of one connection.
#[derive(Clone)]
pub(crate) struct BridgeHandler {
    state: Arc<BridgeState>,
    conn: Arc<Connection>,
}

impl BridgeHandler {
    pub(crate) fn new(state: Arc<BridgeState>, conn: Arc<Connection>) -> Self {
        Self { state, conn }
    }

    fn accepting(&self) -> Result<(), BridgeError> {
        if self.state.shutdown.is_cancelled() {
            Err(BridgeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn registered(&self) -> Result<(Rank, ClientName), BridgeError> {
        let (rank, client) = self
            .conn
            .identity()
            .cloned()
            .ok_or(BridgeError::NotRegistered)?;
        self.state.activity.touch(&client).await;
        Ok((rank, client))
    }
}

impl Bridge for BridgeHandler {
    async fn register(self, _: context::Context, client: ClientName) -> Result<Rank, BridgeError> {
        self.accepting()?;
        if let Some((rank, _)) = self.conn.identity() {
            return Err(BridgeError::AlreadyRegistered { rank: *rank });
        }
        let rank = self
            .state
            .ranks
            .rank_of(&client)
            .ok_or_else(|| BridgeError::UnknownClient(client.clone()))?;

        let mut connections = self.state.connections.lock().await;
        match connections.holder(rank) {
            Some(holder) if holder != self.conn.id => {
                warn!(rank = %rank, client = %client, holder = %holder, "rank already in use");
                return Err(BridgeError::RankInUse { rank });
            }
            _ => {}
        }
        if !self.conn.bind(rank, client.clone()) {
            let rank = self.conn.identity().map(|(rank, _)| *rank).unwrap_or(rank);
            return Err(BridgeError::AlreadyRegistered { rank });
        }
        connections.claim(rank, self.conn.id);
        drop(connections);

        self.state.activity.touch(&client).await;
        info!(rank = %rank, client = %client, conn = %self.conn.id, "client registered");
        Ok(rank)
    }

    async fn aggregate(
        self,
        _: context::Context,
        request: AggregationRequest,
    ) -> Result<AggregationReply, BridgeError> {
        let (rank, client) = self.registered().await?;
        self.accepting()?;

        let limit = self.state.runner.aggr_timeout();
        let seq = request.sequence_number;
        match timeout(limit, self.state.runner.aggregate(rank, request)).await {
            Ok(Ok(reply)) => {
                self.state.activity.touch(&client).await;
                Ok(reply)
            }
            Ok(Err(err)) => {
                warn!(rank = %rank, seq, "aggregation failed: {}", err);
                Err(BridgeError::Runner(err.to_string()))
            }
            Err(_) => {
                warn!(rank = %rank, seq, "aggregation timed out after {:?}", limit);
                Err(BridgeError::Timeout {
                    rank,
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn finish(self, _: context::Context) -> Result<(), BridgeError> {
        let (rank, client) = self.registered().await?;
        let done = self.state.connections.lock().await.finish(rank);
        self.state.activity.retire(&client).await;
        info!(rank = %rank, client = %client, "rank finished ({}/{})", done, self.state.ranks.len());

        if done == self.state.ranks.len() {
            let changed = self.state.status.send_if_modified(|status| {
                if *status == AdaptorStatus::Running {
                    *status = AdaptorStatus::Finished;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!("every rank finished");
            }
        }
        Ok(())
    }
}
