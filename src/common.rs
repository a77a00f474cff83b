use std::path::PathBuf;

use bytes::Bytes;
use derive_more::{Display, From};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Eq, PartialEq, Hash, Debug, Clone, Display, From, Serialize, Deserialize, PartialOrd, Ord)]
/// The identity of a participating site, e.g. `site-1`.
pub struct ClientName(String);

impl ClientName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, From, Serialize, Deserialize, PartialOrd, Ord)]
/// The integer identity a client is known by in the rank-addressed bridge protocol.
pub struct Rank(u32);

impl Rank {
    pub fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique random job identifier
pub struct JobId(Uuid);

impl JobId {
    /// Return a new random job identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// The read-only context a job hands to every call that needs to know which job and site it runs
/// for.
///
/// It is created by the job runtime and only ever passed by reference (or cloned into spawned
/// tasks); nothing in this crate mutates it.
#[derive(Debug, Clone)]
pub struct FlContext {
    pub job_id: JobId,
    pub job_name: String,
    /// Name of the site the controller runs on.
    pub site: String,
    /// Workspace of the job, if it has one.
    pub run_dir: Option<PathBuf>,
}

impl FlContext {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            job_name: job_name.into(),
            site: "server".to_string(),
            run_dir: None,
        }
    }

    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(run_dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// An opaque parameter container carried by tasks and their results.
pub struct Payload(Bytes);

impl Payload {
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Serialize `value` as JSON into a new payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(|bytes| Self(Bytes::from(bytes)))
    }

    /// Deserialize the JSON content of this payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}
