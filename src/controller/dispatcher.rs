//! Issuing tasks to clients and keeping track of what was heard from them.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use tokio::{
    sync::RwLock,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    common::{ClientName, FlContext},
    controller::{
        channel::TaskChannel,
        task::{ClientTask, Task, TaskState},
        ControllerError,
    },
};

/// The last time each client showed signs of life.
///
/// This table is shared between the dispatcher, the bridge server and the monitor loop; every
/// access goes through its lock. Retired clients are done with the job and no longer expected to
/// show up.
#[derive(Debug, Clone, Default)]
pub struct ClientActivity(Arc<RwLock<Sightings>>);

#[derive(Debug, Default)]
struct Sightings {
    last_seen: HashMap<ClientName, Instant>,
    retired: HashSet<ClientName>,
}

impl ClientActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity of `client` now.
    pub async fn touch(&self, client: &ClientName) {
        self.touch_at(client, Instant::now()).await;
    }

    pub async fn touch_at(&self, client: &ClientName, at: Instant) {
        let mut sightings = self.0.write().await;
        let entry = sightings.last_seen.entry(client.clone()).or_insert(at);
        if *entry < at {
            *entry = at;
        }
    }

    /// Give every client without a record a first sighting at `at`.
    pub async fn seed(&self, clients: &[ClientName], at: Instant) {
        let mut sightings = self.0.write().await;
        for client in clients {
            sightings.last_seen.entry(client.clone()).or_insert(at);
        }
    }

    /// Stop expecting activity from `client`.
    pub async fn retire(&self, client: &ClientName) {
        self.0.write().await.retired.insert(client.clone());
    }

    pub async fn is_retired(&self, client: &ClientName) -> bool {
        self.0.read().await.retired.contains(client)
    }

    pub async fn last_seen(&self, client: &ClientName) -> Option<Instant> {
        self.0.read().await.last_seen.get(client).copied()
    }

    /// Return the client among `clients` that has been silent the longest, with how long it
    /// has been silent. Clients without a record and retired clients are ignored.
    pub async fn most_silent(
        &self,
        clients: &[ClientName],
        now: Instant,
    ) -> Option<(ClientName, Duration)> {
        let sightings = self.0.read().await;
        clients
            .iter()
            .filter(|client| !sightings.retired.contains(*client))
            .filter_map(|client| {
                sightings
                    .last_seen
                    .get(client)
                    .map(|last| (client.clone(), now.saturating_duration_since(*last)))
            })
            .max_by_key(|(_, silent)| *silent)
    }
}

/// Issues tasks through a [`TaskChannel`] and enforces the task timeouts.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn TaskChannel>,
    activity: ClientActivity,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn TaskChannel>) -> Self {
        Self {
            channel,
            activity: ClientActivity::new(),
        }
    }

    pub fn activity(&self) -> &ClientActivity {
        &self.activity
    }

    /// Send `task` to one client and wait for its reply, at most `task.timeout()`.
    ///
    /// The returned record is in a terminal state. A reply is recorded as client activity.
    pub async fn send(&self, ctx: &FlContext, task: &Task, client: &ClientName) -> ClientTask {
        let mut record = ClientTask::new(task, client.clone());
        record.mark_sent(Instant::now());
        debug!(client = %client, task = task.name(), "task sent");

        match timeout(task.timeout(), self.channel.send(ctx, client, task)).await {
            Ok(Ok(result)) => {
                let now = Instant::now();
                self.activity.touch_at(client, now).await;
                record.complete(result, now);
            }
            Ok(Err(err)) => {
                let now = Instant::now();
                self.activity.touch_at(client, now).await;
                warn!(client = %client, task = task.name(), "client failed the task: {}", err);
                record.fail(err.to_string(), now);
            }
            Err(_) => {
                warn!(
                    client = %client,
                    task = task.name(),
                    "client did not answer within {:?}",
                    task.timeout()
                );
                record.time_out(task.timeout());
            }
        }
        record
    }

    /// Send `task` to one client; fails unless the client completes it in time.
    pub async fn send_and_wait(
        &self,
        ctx: &FlContext,
        task: &Task,
        client: &ClientName,
    ) -> Result<ClientTask, ControllerError> {
        let record = self.send(ctx, task, client).await;
        match record.state {
            TaskState::Completed => Ok(record),
            _ => Err(ControllerError::task_failed(&record)),
        }
    }

    /// Send `task` to every client concurrently and wait until all of them answered or timed out.
    ///
    /// All or nothing: unless every client completed the task, the first failing client in
    /// `clients` order is reported. The records of all clients are returned either way.
    pub async fn broadcast_and_wait(
        &self,
        ctx: &FlContext,
        task: &Task,
        clients: &[ClientName],
    ) -> (Vec<ClientTask>, Result<(), ControllerError>) {
        info!(
            task = task.name(),
            clients = clients.len(),
            "broadcasting task"
        );
        let records = join_all(clients.iter().map(|client| self.send(ctx, task, client))).await;

        let outcome = match records.iter().find(|r| r.state != TaskState::Completed) {
            Some(failed) => Err(ControllerError::Broadcast {
                task: task.name().to_string(),
                client: failed.client.clone(),
                cause: failed
                    .error
                    .clone()
                    .unwrap_or_else(|| failed.state.to_string()),
            }),
            None => Ok(()),
        };
        (records, outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        common::Payload,
        controller::channel::{ExecutorError, MockTaskChannel},
    };

    fn roster(n: usize) -> Vec<ClientName> {
        (1..=n).map(|i| ClientName::new(format!("site-{}", i))).collect()
    }

    #[tokio::test]
    async fn broadcast_succeeds_when_everybody_answers() {
        let mut channel = MockTaskChannel::new();
        channel
            .expect_send()
            .times(3)
            .returning(|_, _, _| Ok(Payload::from(vec![1])));
        let dispatcher = Dispatcher::new(Arc::new(channel));
        let ctx = FlContext::new("test");
        let task = Task::new("config", Duration::from_secs(1), Payload::empty());

        let (records, outcome) = dispatcher.broadcast_and_wait(&ctx, &task, &roster(3)).await;
        assert!(outcome.is_ok());
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.state == TaskState::Completed));
        for client in roster(3) {
            assert!(dispatcher.activity().last_seen(&client).await.is_some());
        }
    }

    #[tokio::test]
    async fn broadcast_names_the_failing_client() {
        let mut channel = MockTaskChannel::new();
        channel.expect_send().returning(|_, client, task| {
            if client.as_str() == "site-2" {
                Err(ExecutorError::Rejected {
                    task: task.name().to_string(),
                    reason: "bad params".to_string(),
                })
            } else {
                Ok(Payload::empty())
            }
        });
        let dispatcher = Dispatcher::new(Arc::new(channel));
        let ctx = FlContext::new("test");
        let task = Task::new("config", Duration::from_secs(1), Payload::empty());

        let (records, outcome) = dispatcher.broadcast_and_wait(&ctx, &task, &roster(3)).await;
        match outcome {
            Err(ControllerError::Broadcast { task, client, cause }) => {
                assert_eq!(task, "config");
                assert_eq!(client.as_str(), "site-2");
                assert!(cause.contains("bad params"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(records[1].state, TaskState::ClientFailed);
        assert_eq!(records[0].state, TaskState::Completed);
    }

    struct Slow {
        delays: Mutex<HashMap<ClientName, Duration>>,
    }

    #[async_trait]
    impl TaskChannel for Slow {
        async fn send(
            &self,
            _: &FlContext,
            client: &ClientName,
            _: &Task,
        ) -> Result<Payload, ExecutorError> {
            let delay = self.delays.lock().unwrap().get(client).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(Payload::empty())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_times_out() {
        let mut delays = HashMap::new();
        delays.insert(ClientName::from("site-1"), Duration::from_secs(5));
        let dispatcher = Dispatcher::new(Arc::new(Slow {
            delays: Mutex::new(delays),
        }));
        let ctx = FlContext::new("test");
        let task = Task::new("start", Duration::from_secs(1), Payload::empty());

        let err = dispatcher
            .send_and_wait(&ctx, &task, &"site-1".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Task { state: TaskState::TimedOut, .. }
        ));
        assert!(dispatcher
            .activity()
            .last_seen(&"site-1".into())
            .await
            .is_none());

        let ok = dispatcher
            .send_and_wait(&ctx, &task, &"site-2".into())
            .await
            .unwrap();
        assert_eq!(ok.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn most_silent_client() {
        let activity = ClientActivity::new();
        let start = Instant::now();
        activity.touch_at(&"site-1".into(), start).await;
        activity
            .touch_at(&"site-2".into(), start + Duration::from_secs(3))
            .await;
        // older sightings never move a record back in time
        activity.touch_at(&"site-2".into(), start).await;

        let now = start + Duration::from_secs(5);
        let (client, silent) = activity.most_silent(&roster(3), now).await.unwrap();
        assert_eq!(client.as_str(), "site-1");
        assert_eq!(silent, Duration::from_secs(5));

        activity.seed(&roster(3), now).await;
        assert_eq!(activity.last_seen(&"site-3".into()).await, Some(now));
        assert_eq!(activity.last_seen(&"site-1".into()).await, Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn retired_clients_are_never_silent() {
        let activity = ClientActivity::new();
        let start = Instant::now();
        activity.seed(&roster(2), start).await;
        activity
            .touch_at(&"site-2".into(), start + Duration::from_secs(4))
            .await;
        activity.retire(&"site-1".into()).await;
        assert!(activity.is_retired(&"site-1".into()).await);

        let now = start + Duration::from_secs(10);
        let (client, silent) = activity.most_silent(&roster(2), now).await.unwrap();
        assert_eq!(client.as_str(), "site-2");
        assert_eq!(silent, Duration::from_secs(6));

        activity.retire(&"site-2".into()).await;
        assert!(activity.most_silent(&roster(2), now).await.is_none());
    }
}
