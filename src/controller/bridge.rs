//! The workflow driving an external aggregation job through the bridge.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    adaptor::{Adaptor, AdaptorError, RankTable},
    common::{ClientName, FlContext, Payload, Rank},
    controller::{
        dispatcher::{ClientActivity, Dispatcher},
        monitor::{Monitor, MonitorConfig},
        task::Task,
        Controller,
        ControllerError,
    },
    runner::TrainingParams,
};

/// What an [`AdaptorFactory`] needs to build the adaptor of a job.
#[derive(Debug, Clone)]
pub struct BridgeSetup {
    pub ranks: RankTable,
    pub params: TrainingParams,
    /// Bridge calls are recorded here for the monitor.
    pub activity: ClientActivity,
}

/// Builds the adaptor of a bridge job, runner included.
pub trait AdaptorFactory: Send + Sync {
    fn create(&self, ctx: &FlContext, setup: &BridgeSetup) -> Result<Adaptor, AdaptorError>;
}

/// Content of the configure task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub num_rounds: u32,
    pub world_size: u32,
    pub client_ranks: BTreeMap<ClientName, Rank>,
    pub split_mode: u32,
    pub secure_training: bool,
    pub params: serde_json::Value,
}

/// Content of the start task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    /// Where to reach the bridge. `None` when it only accepts in-process connections.
    pub server_address: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct BridgeControllerConfig {
    pub num_rounds: u32,
    pub split_mode: u32,
    pub secure_training: bool,
    pub params: serde_json::Value,
    pub configure_task_name: String,
    pub configure_task_timeout: Duration,
    pub start_task_name: String,
    pub start_task_timeout: Duration,
    pub job_status_check_interval: Duration,
    pub max_client_op_interval: Duration,
    pub progress_timeout: Duration,
    /// Explicit ranks. Clients are ranked in roster order if not set.
    pub client_ranks: Option<HashMap<ClientName, u32>>,
}

impl Default for BridgeControllerConfig {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            split_mode: 0,
            secure_training: false,
            params: serde_json::Value::Object(serde_json::Map::new()),
            configure_task_name: "config".to_string(),
            configure_task_timeout: Duration::from_secs(20),
            start_task_name: "start".to_string(),
            start_task_timeout: Duration::from_secs(10),
            job_status_check_interval: Duration::from_secs(2),
            max_client_op_interval: Duration::from_secs(90),
            progress_timeout: Duration::from_secs(3600),
            client_ranks: None,
        }
    }
}

impl BridgeControllerConfig {
    fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            job_status_check_interval: self.job_status_check_interval,
            max_client_op_interval: self.max_client_op_interval,
            progress_timeout: self.progress_timeout,
        }
    }
}

pub struct BridgeController {
    config: BridgeControllerConfig,
    dispatcher: Dispatcher,
    roster: Vec<ClientName>,
    factory: Arc<dyn AdaptorFactory>,
    ranks: Option<RankTable>,
    adaptor: Option<Adaptor>,
}

impl BridgeController {
    pub fn new(
        config: BridgeControllerConfig,
        dispatcher: Dispatcher,
        roster: Vec<ClientName>,
        factory: Arc<dyn AdaptorFactory>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            roster,
            factory,
            ranks: None,
            adaptor: None,
        }
    }

    pub fn ranks(&self) -> Option<&RankTable> {
        self.ranks.as_ref()
    }

    pub fn adaptor(&self) -> Option<&Adaptor> {
        self.adaptor.as_ref()
    }

    fn rank_table(&self) -> Result<RankTable, ControllerError> {
        if self.roster.is_empty() {
            return Err(ControllerError::InvalidRoster("no clients".to_string()));
        }
        match &self.config.client_ranks {
            Some(explicit) => RankTable::from_explicit(&self.roster, explicit),
            None => RankTable::in_roster_order(&self.roster),
        }
        .map_err(|err| ControllerError::InvalidRoster(err.to_string()))
    }

    fn training_params(&self, ranks: &RankTable) -> TrainingParams {
        TrainingParams {
            num_rounds: self.config.num_rounds,
            world_size: ranks.len() as u32,
            split_mode: self.config.split_mode,
            secure_training: self.config.secure_training,
            params: self.config.params.clone(),
        }
    }

    async fn broadcast(&self, ctx: &FlContext, task: Task) -> Result<(), ControllerError> {
        let (records, outcome) = self
            .dispatcher
            .broadcast_and_wait(ctx, &task, &self.roster)
            .await;
        for record in &records {
            debug!(client = %record.client, state = %record.state, task = task.name(), "task outcome");
        }
        outcome
    }
}

#[async_trait]
impl Controller for BridgeController {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn configure(&mut self, ctx: &FlContext) -> Result<(), ControllerError> {
        let ranks = self.rank_table()?;
        let params = self.training_params(&ranks);
        let setup = BridgeSetup {
            ranks: ranks.clone(),
            params: params.clone(),
            activity: self.dispatcher.activity().clone(),
        };

        let mut adaptor = self.factory.create(ctx, &setup)?;
        adaptor.start(ctx).await?;
        self.adaptor = Some(adaptor);
        self.ranks = Some(ranks.clone());

        let config = ClientConfig {
            num_rounds: params.num_rounds,
            world_size: params.world_size,
            client_ranks: ranks.to_map(),
            split_mode: params.split_mode,
            secure_training: params.secure_training,
            params: params.params,
        };
        let task = Task::new(
            self.config.configure_task_name.clone(),
            self.config.configure_task_timeout,
            Payload::encode(&config)?,
        );
        self.broadcast(ctx, task).await?;
        info!(world_size = ranks.len(), "clients configured");
        Ok(())
    }

    async fn start(&mut self, ctx: &FlContext) -> Result<(), ControllerError> {
        let server_address = self.adaptor.as_ref().and_then(Adaptor::server_address);
        let task = Task::new(
            self.config.start_task_name.clone(),
            self.config.start_task_timeout,
            Payload::encode(&StartParams { server_address })?,
        );
        self.broadcast(ctx, task).await?;
        info!("clients started");
        Ok(())
    }

    async fn monitor(&mut self, _: &FlContext) -> Result<(), ControllerError> {
        let adaptor = self.adaptor.as_ref().ok_or_else(|| {
            ControllerError::BridgeCrashed("bridge server was never started".to_string())
        })?;
        Monitor::new(self.config.monitor())
            .run(adaptor, self.dispatcher.activity(), &self.roster)
            .await
    }

    async fn finalize(&mut self, _: &FlContext) -> Result<(), ControllerError> {
        if let Some(adaptor) = self.adaptor.as_mut() {
            if let Err(err) = adaptor.stop().await {
                warn!("failed to stop the bridge server: {}", err);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adaptor::AdaptorStatus,
        controller::channel::{ExecutorError, MockTaskChannel},
        runner::mock::MockAdaptorFactory,
    };

    fn roster() -> Vec<ClientName> {
        vec!["site-1".into(), "site-2".into()]
    }

    fn controller(channel: MockTaskChannel, config: BridgeControllerConfig) -> BridgeController {
        BridgeController::new(
            config,
            Dispatcher::new(Arc::new(channel)),
            roster(),
            Arc::new(MockAdaptorFactory::new(Duration::from_secs(1))),
        )
    }

    #[tokio::test]
    async fn configure_sends_ranks_and_params() {
        let mut channel = MockTaskChannel::new();
        channel.expect_send().times(2).returning(|_, client, task| {
            assert_eq!(task.name(), "config");
            let config: ClientConfig = task.payload().decode().unwrap();
            assert_eq!(config.world_size, 2);
            assert_eq!(config.num_rounds, 3);
            assert_eq!(config.params["max_depth"], 3);
            assert!(config.client_ranks.contains_key(client));
            Ok(Payload::empty())
        });
        let mut config = BridgeControllerConfig {
            num_rounds: 3,
            params: serde_json::json!({ "max_depth": 3 }),
            ..BridgeControllerConfig::default()
        };
        let mut ranks = HashMap::new();
        ranks.insert(ClientName::from("site-1"), 1);
        ranks.insert(ClientName::from("site-2"), 0);
        config.client_ranks = Some(ranks);

        let mut bridge = controller(channel, config);
        let ctx = FlContext::new("test");
        bridge.configure(&ctx).await.unwrap();
        let table = bridge.ranks().unwrap();
        assert_eq!(table.rank_of(&"site-2".into()), Some(Rank::new(0)));
        assert_eq!(bridge.adaptor().unwrap().status(), AdaptorStatus::Running);

        bridge.finalize(&ctx).await.unwrap();
        assert_eq!(bridge.adaptor().unwrap().status(), AdaptorStatus::Stopped);
    }

    #[tokio::test]
    async fn invalid_ranks_fail_before_anything_is_sent() {
        let mut channel = MockTaskChannel::new();
        channel.expect_send().never();
        let mut ranks = HashMap::new();
        ranks.insert(ClientName::from("site-1"), 0);
        ranks.insert(ClientName::from("site-2"), 0);
        let config = BridgeControllerConfig {
            client_ranks: Some(ranks),
            ..BridgeControllerConfig::default()
        };

        let mut bridge = controller(channel, config);
        let ctx = FlContext::new("test");
        let err = bridge.configure(&ctx).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidRoster(_)));
        assert!(bridge.adaptor().is_none());
        bridge.finalize(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_configure_names_the_client() {
        let mut channel = MockTaskChannel::new();
        channel.expect_send().returning(|_, client, _| {
            if client.as_str() == "site-1" {
                Err(ExecutorError::Execution("no gpu".to_string()))
            } else {
                Ok(Payload::empty())
            }
        });
        let mut bridge = controller(channel, BridgeControllerConfig::default());
        let ctx = FlContext::new("test");

        match bridge.configure(&ctx).await.unwrap_err() {
            ControllerError::Broadcast { task, client, .. } => {
                assert_eq!(task, "config");
                assert_eq!(client.as_str(), "site-1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        bridge.finalize(&ctx).await.unwrap();
    }
}
