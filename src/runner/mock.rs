//! A runner echoing every request back, with configurable latency.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    adaptor::{Adaptor, AdaptorConfig, AdaptorError},
    common::{FlContext, Rank},
    controller::bridge::{AdaptorFactory, BridgeSetup},
    runner::{AggregationReply, AggregationRequest, Runner, RunnerError, TrainingParams},
};

pub struct MockRunner {
    aggr_timeout: Duration,
    delay: Duration,
    rank_delays: HashMap<Rank, Duration>,
    params: Option<TrainingParams>,
    calls: Arc<AtomicU64>,
}

impl MockRunner {
    pub fn new(aggr_timeout: Duration) -> Self {
        Self {
            aggr_timeout,
            delay: Duration::from_secs(0),
            rank_delays: HashMap::new(),
            params: None,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Answer every request after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer the requests of `rank` after `delay` instead of the global delay.
    pub fn with_rank_delay(mut self, rank: Rank, delay: Duration) -> Self {
        self.rank_delays.insert(rank, delay);
        self
    }

    /// Counter of the `aggregate` calls, including those that timed out.
    pub fn calls(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn initialize(&mut self, ctx: &FlContext, params: &TrainingParams) -> Result<(), RunnerError> {
        info!(
            job = %ctx.job_id,
            world_size = params.world_size,
            rounds = params.num_rounds,
            "mock runner initialized"
        );
        self.params = Some(params.clone());
        Ok(())
    }

    fn aggr_timeout(&self) -> Duration {
        self.aggr_timeout
    }

    async fn aggregate(
        &self,
        rank: Rank,
        request: AggregationRequest,
    ) -> Result<AggregationReply, RunnerError> {
        if self.params.is_none() {
            return Err(RunnerError::NotInitialized);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.rank_delays.get(&rank).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(
            rank = %rank,
            op = %request.op,
            seq = request.sequence_number,
            "echoing request"
        );
        Ok(AggregationReply {
            sequence_number: request.sequence_number,
            receive_buffer: request.send_buffer,
        })
    }
}

/// Builds adaptors backed by a [`MockRunner`].
#[derive(Debug, Clone)]
pub struct MockAdaptorFactory {
    pub aggr_timeout: Duration,
    pub delay: Duration,
    pub adaptor: AdaptorConfig,
}

impl MockAdaptorFactory {
    pub fn new(aggr_timeout: Duration) -> Self {
        Self {
            aggr_timeout,
            delay: Duration::from_secs(0),
            adaptor: AdaptorConfig::default(),
        }
    }
}

impl AdaptorFactory for MockAdaptorFactory {
    fn create(&self, ctx: &FlContext, setup: &BridgeSetup) -> Result<Adaptor, AdaptorError> {
        let mut runner = MockRunner::new(self.aggr_timeout).with_delay(self.delay);
        runner.initialize(ctx, &setup.params)?;
        Ok(Adaptor::new(
            Arc::new(runner),
            self.adaptor.clone(),
            setup.ranks.clone(),
            setup.activity.clone(),
        ))
    }
}
