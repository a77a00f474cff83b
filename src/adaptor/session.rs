//! The client side of the bridge, as used by the processes of the external job.

use std::{io, net::SocketAddr, time::Duration};

use tarpc::{client, context, serde_transport::tcp, tokio_serde::formats::Json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    adaptor::{
        rpc::{BridgeClient, BridgeError},
        server::LocalTransport,
    },
    common::{ClientName, Rank},
    runner::{AggregationReply, AggregationRequest},
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to connect to the bridge: {0}")]
    Connect(#[from] io::Error),
    #[error("the bridge server is gone")]
    Closed,
    #[error("rpc failed: {0}")]
    Rpc(#[from] client::RpcError),
    #[error("bridge refused the request: {0}")]
    Bridge(#[from] BridgeError),
}

/// Time the bridge gets, past the aggregation timeout, to report that the timeout expired.
const ANSWER_MARGIN: Duration = Duration::from_secs(60);

/// The deadline extension needed for calls that may last up to `aggr_timeout`.
pub(crate) fn deadline_slack(aggr_timeout: Duration) -> Duration {
    aggr_timeout.saturating_add(ANSWER_MARGIN)
}

/// A connection to the bridge server.
pub struct BridgeSession {
    client: BridgeClient,
    deadline_slack: Duration,
}

impl BridgeSession {
    fn new(client: BridgeClient) -> Self {
        Self {
            client,
            deadline_slack: ANSWER_MARGIN,
        }
    }

    /// Connect to a bridge server serving TCP.
    pub async fn connect_tcp(
        address: SocketAddr,
        max_frame_length: usize,
    ) -> Result<Self, SessionError> {
        let mut transport = tcp::connect(address, Json::default);
        transport.config_mut().max_frame_length(max_frame_length);
        let client = BridgeClient::new(client::Config::default(), transport.await?).spawn();
        debug!(address = %address, "connected to the bridge");
        Ok(Self::new(client))
    }

    /// Extend the deadline of every call by `slack`, on top of the RPC default.
    pub fn with_deadline_slack(mut self, slack: Duration) -> Self {
        self.deadline_slack = slack;
        self
    }

    /// Keep every call open long enough for an aggregation bounded by `aggr_timeout`, so that an
    /// expiry reaches the client as [`BridgeError::Timeout`] rather than as an RPC deadline.
    pub fn with_aggr_timeout(self, aggr_timeout: Duration) -> Self {
        self.with_deadline_slack(deadline_slack(aggr_timeout))
    }

    fn context(&self) -> context::Context {
        let mut ctx = context::current();
        ctx.deadline += self.deadline_slack;
        ctx
    }

    pub async fn register(&self, client: ClientName) -> Result<Rank, SessionError> {
        Ok(self.client.register(self.context(), client).await??)
    }

    pub async fn aggregate(
        &self,
        request: AggregationRequest,
    ) -> Result<AggregationReply, SessionError> {
        Ok(self.client.aggregate(self.context(), request).await??)
    }

    pub async fn finish(&self) -> Result<(), SessionError> {
        Ok(self.client.finish(self.context()).await??)
    }
}

/// Opens in-memory connections to a bridge server running in the same process.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    server: mpsc::UnboundedSender<LocalTransport>,
}

impl LocalConnector {
    pub(crate) fn new(server: mpsc::UnboundedSender<LocalTransport>) -> Self {
        Self { server }
    }

    /// Open a new connection. Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<BridgeSession, SessionError> {
        let (client_side, server_side) = tarpc::transport::channel::unbounded();
        self.server
            .send(server_side)
            .map_err(|_| SessionError::Closed)?;
        let client = BridgeClient::new(client::Config::default(), client_side).spawn();
        Ok(BridgeSession::new(client))
    }
}

impl SessionError {
    /// The bridge error behind this failure, if the server answered with one.
    pub fn bridge_error(&self) -> Option<&BridgeError> {
        match self {
            SessionError::Bridge(err) => Some(err),
            _ => None,
        }
    }
}
