//! The bridge between a controller and an external aggregation engine.
//!
//! The processes of the external job connect to the bridge server, each announcing the client it
//! runs for. The server maps the client to its rank and forwards every aggregation request to the
//! [`Runner`], bounded by the runner's timeout. The server either runs on a task of the caller's
//! runtime and accepts in-memory connections from a [`LocalConnector`], or on a thread of its own
//! serving TCP.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use derive_more::Display;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    common::FlContext,
    controller::{ClientActivity, CompletionProbe, ControllerError},
    runner::{Runner, RunnerError},
};

pub mod connections;
pub mod rpc;
mod server;
pub mod session;

pub use self::{
    connections::{RankTable, RankTableError},
    rpc::{BridgeClient, BridgeError},
    session::{BridgeSession, LocalConnector, SessionError},
};

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum AdaptorStatus {
    /// Not started yet.
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "running")]
    Running,
    /// Every rank called `finish`.
    #[display(fmt = "finished")]
    Finished,
    /// Stopped before every rank finished.
    #[display(fmt = "stopped")]
    Stopped,
    /// The server went away without being stopped.
    #[display(fmt = "crashed: {}", _0)]
    Crashed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptorConfig {
    /// Serve in-memory connections from the caller's runtime instead of TCP from a thread.
    pub in_process: bool,
    /// Where to listen when not in process. Port `0` picks a free port.
    pub bind_address: SocketAddr,
    /// Largest accepted RPC frame, in bytes.
    pub max_frame_length: usize,
    /// How long in-flight calls may take to complete once a stop is requested.
    pub shutdown_grace: Duration,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            in_process: true,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_length: 64 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Error, Debug)]
pub enum AdaptorError {
    #[error("the bridge server is already started")]
    AlreadyStarted,
    #[error("the runner cannot be replaced once the bridge server is started")]
    RunnerRebind,
    #[error("failed to start the bridge server: {0}")]
    Bind(#[from] io::Error),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}

struct ServerHandle {
    state: Arc<rpc::BridgeState>,
    done: oneshot::Receiver<()>,
    address: Option<SocketAddr>,
}

/// Owns the bridge server of one job and the runner behind it.
pub struct Adaptor {
    runner: Arc<dyn Runner>,
    config: AdaptorConfig,
    ranks: RankTable,
    activity: ClientActivity,
    status_tx: Arc<watch::Sender<AdaptorStatus>>,
    status_rx: watch::Receiver<AdaptorStatus>,
    connector: Option<LocalConnector>,
    incoming: Option<mpsc::UnboundedReceiver<server::LocalTransport>>,
    server: Option<ServerHandle>,
    started: bool,
}

impl Adaptor {
    /// Create an adaptor for the clients of `ranks`. Bridge calls are recorded in `activity`.
    pub fn new(
        runner: Arc<dyn Runner>,
        config: AdaptorConfig,
        ranks: RankTable,
        activity: ClientActivity,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(AdaptorStatus::Idle);
        let (connector, incoming) = if config.in_process {
            let (connector_tx, connector_rx) = mpsc::unbounded_channel();
            (Some(LocalConnector::new(connector_tx)), Some(connector_rx))
        } else {
            (None, None)
        };
        Self {
            runner,
            config,
            ranks,
            activity,
            status_tx: Arc::new(status_tx),
            status_rx,
            connector,
            incoming,
            server: None,
            started: false,
        }
    }

    /// Replace the runner. Only possible before the server is started.
    pub fn set_runner(&mut self, runner: Arc<dyn Runner>) -> Result<(), AdaptorError> {
        if self.started {
            return Err(AdaptorError::RunnerRebind);
        }
        self.runner = runner;
        Ok(())
    }

    pub fn config(&self) -> &AdaptorConfig {
        &self.config
    }

    pub fn ranks(&self) -> &RankTable {
        &self.ranks
    }

    pub fn status(&self) -> AdaptorStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch the status changes.
    pub fn subscribe(&self) -> watch::Receiver<AdaptorStatus> {
        self.status_rx.clone()
    }

    /// The connector to an in-process server. Connections opened before the server is started
    /// are served once it is.
    pub fn local_connector(&self) -> Option<LocalConnector> {
        self.connector.clone()
    }

    /// The address of a TCP server, once started.
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(|server| server.address)
    }

    /// Start the bridge server.
    pub async fn start(&mut self, ctx: &FlContext) -> Result<(), AdaptorError> {
        if self.started {
            return Err(AdaptorError::AlreadyStarted);
        }

        let state = Arc::new(rpc::BridgeState::new(
            self.runner.clone(),
            self.ranks.clone(),
            self.activity.clone(),
            self.status_tx.clone(),
        ));
        let (done_tx, done_rx) = oneshot::channel();

        // the status must be running before the server can report a crash
        self.status_tx.send_replace(AdaptorStatus::Running);
        let address = if let Some(incoming) = self.incoming.take() {
            tokio::spawn(server::run_local(state.clone(), incoming, done_tx));
            None
        } else {
            match server::spawn_tcp(
                state.clone(),
                self.config.bind_address,
                self.config.max_frame_length,
                done_tx,
            )
            .await
            {
                Ok(address) => Some(address),
                Err(err) => {
                    self.status_tx.send_replace(AdaptorStatus::Idle);
                    return Err(AdaptorError::Bind(err));
                }
            }
        };

        self.started = true;
        self.server = Some(ServerHandle {
            state,
            done: done_rx,
            address,
        });
        info!(
            job = %ctx.job_id,
            world_size = self.ranks.len(),
            in_process = self.config.in_process,
            address = ?address,
            "bridge server started"
        );
        Ok(())
    }

    /// Stop the bridge server: refuse new connections and calls, let the in-flight calls
    /// complete for at most the shutdown grace period, then close the remaining connections.
    ///
    /// Stopping an adaptor that was never started, or twice, does nothing.
    pub async fn stop(&mut self) -> Result<(), AdaptorError> {
        let server = match self.server.take() {
            Some(server) => server,
            None => return Ok(()),
        };
        let grace = self.config.shutdown_grace;
        info!("stopping bridge server");

        server.state.shutdown.cancel();
        server.state.calls.close();
        if timeout(grace, server.state.calls.wait()).await.is_err() {
            warn!(
                "{} calls still in flight after {:?}, closing connections",
                server.state.calls.len(),
                grace
            );
        }
        server.state.force_close.cancel();
        if timeout(grace, server.done).await.is_err() {
            warn!("bridge server did not wind down within {:?}", grace);
        }

        self.status_tx.send_if_modified(|status| {
            if *status == AdaptorStatus::Running {
                *status = AdaptorStatus::Stopped;
                true
            } else {
                false
            }
        });
        info!(status = %self.status(), "bridge server stopped");
        Ok(())
    }
}

impl CompletionProbe for Adaptor {
    fn check(&self) -> Result<bool, ControllerError> {
        match self.status() {
            AdaptorStatus::Finished => Ok(true),
            AdaptorStatus::Crashed(reason) => Err(ControllerError::BridgeCrashed(reason)),
            AdaptorStatus::Stopped => Err(ControllerError::BridgeCrashed(
                "bridge server stopped before completion".to_string(),
            )),
            AdaptorStatus::Idle | AdaptorStatus::Running => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::ClientName, runner::mock::MockRunner};

    fn adaptor() -> Adaptor {
        let roster: Vec<ClientName> = vec!["site-1".into(), "site-2".into()];
        Adaptor::new(
            Arc::new(MockRunner::new(Duration::from_secs(1))),
            AdaptorConfig::default(),
            RankTable::in_roster_order(&roster).unwrap(),
            ClientActivity::new(),
        )
    }

    #[tokio::test]
    async fn runner_is_fixed_once_started() {
        let mut adaptor = adaptor();
        adaptor
            .set_runner(Arc::new(MockRunner::new(Duration::from_secs(2))))
            .unwrap();
        assert_eq!(adaptor.status(), AdaptorStatus::Idle);

        adaptor.start(&FlContext::new("test")).await.unwrap();
        assert_eq!(adaptor.status(), AdaptorStatus::Running);
        assert!(adaptor.local_connector().is_some());
        assert!(adaptor.server_address().is_none());

        let err = adaptor
            .set_runner(Arc::new(MockRunner::new(Duration::from_secs(3))))
            .unwrap_err();
        assert!(matches!(err, AdaptorError::RunnerRebind));
        assert!(matches!(
            adaptor.start(&FlContext::new("test")).await.unwrap_err(),
            AdaptorError::AlreadyStarted
        ));

        adaptor.stop().await.unwrap();
        assert_eq!(adaptor.status(), AdaptorStatus::Stopped);
        assert!(adaptor.check().is_err());
        adaptor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn probe_follows_status() {
        let adaptor = adaptor();
        assert!(!adaptor.check().unwrap());
        adaptor.status_tx.send_replace(AdaptorStatus::Finished);
        assert!(adaptor.check().unwrap());
        adaptor
            .status_tx
            .send_replace(AdaptorStatus::Crashed("boom".to_string()));
        match adaptor.check() {
            Err(ControllerError::BridgeCrashed(reason)) => assert_eq!(reason, "boom"),
            other => panic!("unexpected probe result: {:?}", other),
        }
    }
}
