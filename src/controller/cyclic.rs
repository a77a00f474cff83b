//! The cyclic workflow: one artifact relayed client by client, round after round.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    common::{ClientName, FlContext, Payload},
    controller::{
        dispatcher::Dispatcher,
        persistor::ArtifactPersistor,
        task::{Task, TaskState, HEADER_CLIENT_INDEX, HEADER_CURRENT_ROUND, HEADER_NUM_ROUNDS},
        Controller,
        ControllerError,
    },
};

/// In which order the clients receive the artifact within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayOrder {
    /// Roster order, every round.
    Fixed,
    /// A new shuffle every round, derived from `seed` and the round number.
    Random { seed: u64 },
    /// Like [`RelayOrder::Random`], but a client never gets the artifact twice in a row across
    /// a round boundary.
    RandomWithoutSameInARow { seed: u64 },
}

impl Default for RelayOrder {
    fn default() -> Self {
        RelayOrder::Fixed
    }
}

#[derive(Debug, Clone)]
pub struct CyclicConfig {
    pub num_clients: usize,
    pub num_rounds: u32,
    pub task_name: String,
    pub task_timeout: Duration,
    pub order: RelayOrder,
    /// Save the artifact every that many rounds. `0` only saves the final artifact.
    pub persist_every_n_rounds: u32,
}

impl Default for CyclicConfig {
    fn default() -> Self {
        Self {
            num_clients: 2,
            num_rounds: 5,
            task_name: "train".to_string(),
            task_timeout: Duration::from_secs(60),
            order: RelayOrder::Fixed,
            persist_every_n_rounds: 0,
        }
    }
}

/// One step of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub round: u32,
    /// Position of the client in the relay order of the round.
    pub client_index: usize,
    pub client: ClientName,
}

pub struct CyclicController {
    config: CyclicConfig,
    dispatcher: Dispatcher,
    roster: Vec<ClientName>,
    persistor: Option<Arc<dyn ArtifactPersistor>>,
    participants: Vec<ClientName>,
    artifact: Payload,
    round: u32,
    index: usize,
    history: Vec<Dispatch>,
}

impl CyclicController {
    /// Create a workflow relaying `initial` among the first `config.num_clients` clients of
    /// `roster`.
    pub fn new(
        config: CyclicConfig,
        dispatcher: Dispatcher,
        roster: Vec<ClientName>,
        initial: Payload,
    ) -> Self {
        Self {
            config,
            dispatcher,
            roster,
            persistor: None,
            participants: Vec::new(),
            artifact: initial,
            round: 0,
            index: 0,
            history: Vec::new(),
        }
    }

    pub fn with_persistor(mut self, persistor: Arc<dyn ArtifactPersistor>) -> Self {
        self.persistor = Some(persistor);
        self
    }

    /// The current artifact, the final one once the workflow completed.
    pub fn artifact(&self) -> &Payload {
        &self.artifact
    }

    /// Every dispatch so far, in the order they happened.
    pub fn history(&self) -> &[Dispatch] {
        &self.history
    }

    /// The round in progress, `num_rounds` once done.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// The relay order of `round` given the last client of the previous round.
    pub fn relay_order(&self, round: u32, previous_last: Option<&ClientName>) -> Vec<ClientName> {
        let mut order = self.participants.clone();
        match self.config.order {
            RelayOrder::Fixed => {}
            RelayOrder::Random { seed } => shuffle(&mut order, seed, round),
            RelayOrder::RandomWithoutSameInARow { seed } => {
                shuffle(&mut order, seed, round);
                if order.len() > 1 && order.first() == previous_last {
                    order.rotate_left(1);
                }
            }
        }
        order
    }

    fn persist_due(&self, completed_rounds: u32) -> bool {
        let every = self.config.persist_every_n_rounds;
        every > 0 && completed_rounds % every == 0
    }

    async fn relay_once(
        &mut self,
        ctx: &FlContext,
        client: &ClientName,
        client_index: usize,
    ) -> Result<(), ControllerError> {
        let round = self.round;
        let task = Task::new(
            self.config.task_name.clone(),
            self.config.task_timeout,
            self.artifact.clone(),
        )
        .with_header(HEADER_CURRENT_ROUND, round)
        .with_header(HEADER_NUM_ROUNDS, self.config.num_rounds)
        .with_header(HEADER_CLIENT_INDEX, client_index);

        self.history.push(Dispatch {
            round,
            client_index,
            client: client.clone(),
        });
        let record = self.dispatcher.send(ctx, &task, client).await;

        let relay_failed = |cause: String| {
            warn!(round, client = %client, "relay failed: {}", cause);
            ControllerError::RelayFailed {
                round,
                client: client.clone(),
                cause,
            }
        };
        if record.state != TaskState::Completed {
            let cause = record.error.unwrap_or_else(|| record.state.to_string());
            return Err(relay_failed(cause));
        }
        match record.result {
            Some(artifact) if !artifact.is_empty() => {
                debug!(round, client = %client, bytes = artifact.len(), "artifact relayed");
                self.artifact = artifact;
                Ok(())
            }
            _ => Err(relay_failed("client returned an empty artifact".to_string())),
        }
    }
}

fn shuffle(clients: &mut [ClientName], seed: u64, round: u32) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed.wrapping_add(u64::from(round)));
    clients.shuffle(&mut rng);
}

#[async_trait]
impl Controller for CyclicController {
    fn name(&self) -> &str {
        "cyclic"
    }

    async fn configure(&mut self, ctx: &FlContext) -> Result<(), ControllerError> {
        let wanted = self.config.num_clients;
        if wanted == 0 {
            return Err(ControllerError::InvalidRoster(
                "the relay needs at least one client".to_string(),
            ));
        }
        if self.roster.len() < wanted {
            return Err(ControllerError::InvalidRoster(format!(
                "{} clients requested but only {} available",
                wanted,
                self.roster.len()
            )));
        }
        self.participants = self.roster[..wanted].to_vec();

        if let Some(persistor) = &self.persistor {
            if let Some(initial) = persistor.load(ctx).await? {
                self.artifact = initial;
            }
        }
        info!(
            clients = ?self.participants,
            rounds = self.config.num_rounds,
            order = ?self.config.order,
            "cyclic workflow configured"
        );
        Ok(())
    }

    async fn start(&mut self, _: &FlContext) -> Result<(), ControllerError> {
        self.round = 0;
        self.index = 0;
        self.history.clear();
        Ok(())
    }

    async fn monitor(&mut self, ctx: &FlContext) -> Result<(), ControllerError> {
        let mut previous_last: Option<ClientName> = None;
        while self.round < self.config.num_rounds {
            let order = self.relay_order(self.round, previous_last.as_ref());
            info!(round = self.round, order = ?order, "starting round");

            self.index = 0;
            while self.index < order.len() {
                let client = &order[self.index];
                self.relay_once(ctx, client, self.index).await?;
                self.index += 1;
            }
            previous_last = order.last().cloned();
            self.round += 1;

            if self.persist_due(self.round) {
                if let Some(persistor) = &self.persistor {
                    persistor.save_round(ctx, self.round, &self.artifact).await?;
                }
            }
        }

        if let Some(persistor) = &self.persistor {
            persistor.save_final(ctx, &self.artifact).await?;
        }
        info!(rounds = self.round, "relay completed");
        Ok(())
    }

    async fn finalize(&mut self, _: &FlContext) -> Result<(), ControllerError> {
        debug!(
            round = self.round,
            index = self.index,
            dispatches = self.history.len(),
            "cyclic workflow finalized"
        );
        Ok(())
    }
}
