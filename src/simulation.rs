//! Simulated client sites, for running jobs without a real deployment.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    adaptor::{Adaptor, AdaptorError, BridgeSession, LocalConnector, SessionError},
    common::{ClientName, FlContext, Payload},
    controller::{
        bridge::{AdaptorFactory, BridgeSetup, ClientConfig, StartParams},
        channel::{Executor, ExecutorError},
        task::{Task, HEADER_CURRENT_ROUND},
    },
    runner::{AggregationRequest, CollectiveOp},
};

/// A site of the cyclic workflow whose "model" is a counter: every visit increments it.
pub struct CounterExecutor {
    site: ClientName,
    work: Duration,
}

impl CounterExecutor {
    pub fn new(site: ClientName) -> Self {
        Self {
            site,
            work: Duration::from_secs(0),
        }
    }

    /// Pretend that every visit takes `work`.
    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }
}

#[async_trait]
impl Executor for CounterExecutor {
    async fn execute(&self, _: &FlContext, task: &Task) -> Result<Payload, ExecutorError> {
        let counter: u64 = task
            .payload()
            .decode()
            .map_err(|err| ExecutorError::Execution(err.to_string()))?;
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        info!(
            site = %self.site,
            round = task.header(HEADER_CURRENT_ROUND).unwrap_or("?"),
            counter,
            "incremented the counter"
        );
        Payload::encode(&(counter + 1)).map_err(|err| ExecutorError::Execution(err.to_string()))
    }
}

/// A site of the bridge workflow.
///
/// It accepts the configure task, and on the start task it connects to the bridge and runs one
/// all-reduce per round in the background before calling `finish`.
pub struct BridgeSiteExecutor {
    site: ClientName,
    configure_task: String,
    start_task: String,
    connector: ConnectorSlot,
    max_frame_length: usize,
    aggr_timeout: Option<Duration>,
    max_retries: u32,
    config: Mutex<Option<ClientConfig>>,
    worker: Mutex<Option<JoinHandle<Result<(), SessionError>>>>,
}

impl BridgeSiteExecutor {
    pub fn new(
        site: ClientName,
        configure_task: impl Into<String>,
        start_task: impl Into<String>,
    ) -> Self {
        Self {
            site,
            configure_task: configure_task.into(),
            start_task: start_task.into(),
            connector: ConnectorSlot::default(),
            max_frame_length: 64 * 1024 * 1024,
            aggr_timeout: None,
            max_retries: 5,
            config: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Reach the bridge in process through `slot` when the start task carries no server address.
    pub fn with_connector_slot(mut self, slot: ConnectorSlot) -> Self {
        self.connector = slot;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Size the call deadlines for a bridge whose aggregations may last up to `aggr_timeout`.
    pub fn with_aggr_timeout(mut self, aggr_timeout: Duration) -> Self {
        self.aggr_timeout = Some(aggr_timeout);
        self
    }

    /// Give up on a round after `max_retries` timed out attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wait for the background work started by the start task.
    pub async fn join(&self) -> Option<Result<(), SessionError>> {
        let worker = self.worker.lock().await.take()?;
        match worker.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(site = %self.site, "bridge worker panicked: {}", err);
                Some(Err(SessionError::Closed))
            }
        }
    }

    async fn configure(&self, task: &Task) -> Result<Payload, ExecutorError> {
        let config: ClientConfig = task.payload().decode().map_err(|err| ExecutorError::Rejected {
            task: task.name().to_string(),
            reason: err.to_string(),
        })?;
        if !config.client_ranks.contains_key(&self.site) {
            return Err(ExecutorError::Rejected {
                task: task.name().to_string(),
                reason: format!("{} has no rank", self.site),
            });
        }
        debug!(site = %self.site, world_size = config.world_size, "configured");
        *self.config.lock().await = Some(config);
        Ok(Payload::empty())
    }

    async fn start(&self, task: &Task) -> Result<Payload, ExecutorError> {
        let rejected = |reason: String| ExecutorError::Rejected {
            task: task.name().to_string(),
            reason,
        };
        let params: StartParams = task.payload().decode().map_err(|err| rejected(err.to_string()))?;
        let rounds = self
            .config
            .lock()
            .await
            .as_ref()
            .map(|config| config.num_rounds)
            .ok_or_else(|| rejected("not configured".to_string()))?;

        let session = match (params.server_address, self.connector.get()) {
            (Some(address), _) => BridgeSession::connect_tcp(address, self.max_frame_length)
                .await
                .map_err(|err| ExecutorError::Execution(err.to_string()))?,
            (None, Some(connector)) => connector
                .connect()
                .map_err(|err| ExecutorError::Execution(err.to_string()))?,
            (None, None) => return Err(rejected("no way to reach the bridge".to_string())),
        };
        let session = match self.aggr_timeout {
            Some(aggr_timeout) => session.with_aggr_timeout(aggr_timeout),
            None => session,
        };

        let site = self.site.clone();
        let max_retries = self.max_retries;
        let worker = tokio::spawn(async move {
            run_rounds(session, site, rounds, max_retries, RETRY_BACKOFF).await
        });
        *self.worker.lock().await = Some(worker);
        Ok(Payload::empty())
    }
}

/// Pause before the first retry of a timed out round; every further retry waits one more step.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

async fn run_rounds(
    session: BridgeSession,
    site: ClientName,
    rounds: u32,
    max_retries: u32,
    backoff: Duration,
) -> Result<(), SessionError> {
    let rank = session.register(site.clone()).await?;
    info!(site = %site, rank = %rank, "registered with the bridge");

    for round in 0..rounds {
        let request = AggregationRequest {
            op: CollectiveOp::Allreduce,
            sequence_number: u64::from(round),
            send_buffer: Bytes::from(format!("{}:{}", site, round)),
        };
        let mut attempt = 0;
        loop {
            match session.aggregate(request.clone()).await {
                Ok(reply) => {
                    debug!(site = %site, round, bytes = reply.receive_buffer.len(), "round done");
                    break;
                }
                Err(SessionError::Bridge(err)) if err.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    warn!(site = %site, round, attempt, "retrying: {}", err);
                    tokio::time::sleep(backoff * attempt).await;
                }
                Err(err) => {
                    warn!(site = %site, round, "giving up: {}", err);
                    return Err(err);
                }
            }
        }
    }

    session.finish().await?;
    info!(site = %site, "finished");
    Ok(())
}

#[async_trait]
impl Executor for BridgeSiteExecutor {
    async fn execute(&self, _: &FlContext, task: &Task) -> Result<Payload, ExecutorError> {
        if task.name() == self.configure_task {
            self.configure(task).await
        } else if task.name() == self.start_task {
            self.start(task).await
        } else {
            Err(ExecutorError::Rejected {
                task: task.name().to_string(),
                reason: "unknown task".to_string(),
            })
        }
    }
}

/// Where the connector of an in-process bridge is published once its adaptor exists.
pub type ConnectorSlot = Arc<OnceLock<LocalConnector>>;

/// Wraps an [`AdaptorFactory`] and publishes the local connector of every adaptor it creates.
pub struct PublishingFactory<F> {
    inner: F,
    slot: ConnectorSlot,
}

impl<F> PublishingFactory<F> {
    pub fn new(inner: F, slot: ConnectorSlot) -> Self {
        Self { inner, slot }
    }
}

impl<F> AdaptorFactory for PublishingFactory<F>
where
    F: AdaptorFactory,
{
    fn create(&self, ctx: &FlContext, setup: &BridgeSetup) -> Result<Adaptor, AdaptorError> {
        let adaptor = self.inner.create(ctx, setup)?;
        if let Some(connector) = adaptor.local_connector() {
            if self.slot.set(connector).is_err() {
                warn!("a connector was already published, keeping the first one");
            }
        }
        Ok(adaptor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        adaptor::{AdaptorConfig, BridgeError, RankTable},
        controller::ClientActivity,
        runner::{mock::MockRunner, Runner, TrainingParams},
    };

    #[tokio::test]
    async fn retries_are_capped() {
        let site = ClientName::from("site-1");
        let mut runner =
            MockRunner::new(Duration::from_millis(20)).with_delay(Duration::from_millis(200));
        runner
            .initialize(
                &FlContext::new("sim"),
                &TrainingParams {
                    num_rounds: 2,
                    world_size: 1,
                    split_mode: 0,
                    secure_training: false,
                    params: serde_json::json!({}),
                },
            )
            .unwrap();
        let calls = runner.calls();
        let mut adaptor = Adaptor::new(
            Arc::new(runner),
            AdaptorConfig::default(),
            RankTable::in_roster_order(&[site.clone()]).unwrap(),
            ClientActivity::new(),
        );
        adaptor.start(&FlContext::new("sim")).await.unwrap();
        let session = adaptor.local_connector().unwrap().connect().unwrap();

        let err = run_rounds(session, site, 2, 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err.bridge_error(), Some(BridgeError::Timeout { .. })));
        // the first attempt of round 0 and its three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        adaptor.stop().await.unwrap();
    }
}
