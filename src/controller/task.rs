//! Tasks and the per-client records of their outcome.

use std::{collections::BTreeMap, time::Duration};

use derive_more::Display;
use tokio::time::Instant;
use uuid::Uuid;

use crate::common::{ClientName, Payload};

/// Header carrying the round a task belongs to.
pub const HEADER_CURRENT_ROUND: &str = "current_round";
/// Header carrying the total number of rounds of the workflow.
pub const HEADER_NUM_ROUNDS: &str = "num_rounds";
/// Header carrying the position of the receiving client in the relay.
pub const HEADER_CLIENT_INDEX: &str = "client_index";

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display)]
/// A unique random task identifier
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// A named unit of dispatchable work.
///
/// A task is immutable once built: the same value is handed to every client it is sent to.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    name: String,
    timeout: Duration,
    headers: BTreeMap<String, String>,
    payload: Payload,
}

impl Task {
    pub fn new(name: impl Into<String>, timeout: Duration, payload: Payload) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            timeout,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Attach a header to the task. Only meant to be used while building it.
    pub fn with_header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.headers.insert(key.into(), value.to_string());
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Lifecycle of a task as seen for one client.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum TaskState {
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "sent")]
    Sent,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "timed out")]
    TimedOut,
    #[display(fmt = "client failed")]
    ClientFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::TimedOut | TaskState::ClientFailed
        )
    }
}

/// The outcome of one task for one client.
#[derive(Debug, Clone)]
pub struct ClientTask {
    pub task_id: TaskId,
    pub task_name: String,
    pub client: ClientName,
    pub state: TaskState,
    pub sent_at: Option<Instant>,
    /// Last time anything was heard from the client about this task.
    pub last_seen: Option<Instant>,
    pub result: Option<Payload>,
    /// Why the task did not complete.
    pub error: Option<String>,
}

impl ClientTask {
    pub fn new(task: &Task, client: ClientName) -> Self {
        Self {
            task_id: task.id(),
            task_name: task.name().to_string(),
            client,
            state: TaskState::Pending,
            sent_at: None,
            last_seen: None,
            result: None,
            error: None,
        }
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.state = TaskState::Sent;
        self.sent_at = Some(now);
    }

    pub(crate) fn complete(&mut self, result: Payload, now: Instant) {
        self.state = TaskState::Completed;
        self.last_seen = Some(now);
        self.result = Some(result);
    }

    pub(crate) fn fail(&mut self, reason: String, now: Instant) {
        self.state = TaskState::ClientFailed;
        self.last_seen = Some(now);
        self.error = Some(reason);
    }

    pub(crate) fn time_out(&mut self, timeout: Duration) {
        self.state = TaskState::TimedOut;
        self.error = Some(format!("no response within {:?}", timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_headers() {
        let task = Task::new("train", Duration::from_secs(1), Payload::empty())
            .with_header(HEADER_CURRENT_ROUND, 2)
            .with_header(HEADER_NUM_ROUNDS, 3);
        assert_eq!(task.header(HEADER_CURRENT_ROUND), Some("2"));
        assert_eq!(task.header(HEADER_NUM_ROUNDS), Some("3"));
        assert_eq!(task.header(HEADER_CLIENT_INDEX), None);
    }

    #[tokio::test]
    async fn client_task_lifecycle() {
        let task = Task::new("config", Duration::from_millis(10), Payload::empty());
        let mut record = ClientTask::new(&task, "site-1".into());
        assert_eq!(record.state, TaskState::Pending);
        assert!(!record.state.is_terminal());

        record.mark_sent(Instant::now());
        assert_eq!(record.state, TaskState::Sent);
        assert!(record.sent_at.is_some());

        record.time_out(task.timeout());
        assert_eq!(record.state, TaskState::TimedOut);
        assert!(record.state.is_terminal());
        assert!(record.error.as_deref().unwrap().contains("10ms"));
    }
}
