//! Storage of the artifact relayed by the cyclic workflow.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::common::{FlContext, Payload};

#[derive(Error, Debug)]
pub enum PersistorError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Loads the initial artifact of a workflow and saves its intermediate and final versions.
#[async_trait]
pub trait ArtifactPersistor: Send + Sync {
    /// Return the stored initial artifact, if there is one.
    async fn load(&self, ctx: &FlContext) -> Result<Option<Payload>, PersistorError>;

    /// Save the artifact as it is after `round` completed rounds.
    async fn save_round(
        &self,
        ctx: &FlContext,
        round: u32,
        artifact: &Payload,
    ) -> Result<(), PersistorError>;

    async fn save_final(&self, ctx: &FlContext, artifact: &Payload) -> Result<(), PersistorError>;
}

/// Keeps artifacts as files of a directory: `initial.bin`, `round-<n>.bin` and `final.bin`.
pub struct FilePersistor {
    dir: PathBuf,
}

impl FilePersistor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn initial_path(&self) -> PathBuf {
        self.dir.join("initial.bin")
    }

    pub fn round_path(&self, round: u32) -> PathBuf {
        self.dir.join(format!("round-{}.bin", round))
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir.join("final.bin")
    }

    async fn write(&self, path: PathBuf, artifact: &Payload) -> Result<(), PersistorError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| PersistorError::Write {
                path: self.dir.clone(),
                source,
            })?;
        fs::write(&path, artifact.as_bytes())
            .await
            .map_err(|source| PersistorError::Write {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), bytes = artifact.len(), "artifact saved");
        Ok(())
    }
}

#[async_trait]
impl ArtifactPersistor for FilePersistor {
    async fn load(&self, _: &FlContext) -> Result<Option<Payload>, PersistorError> {
        let path = self.initial_path();
        match fs::read(&path).await {
            Ok(bytes) => {
                info!(path = %path.display(), "loaded initial artifact");
                Ok(Some(Payload::from(Bytes::from(bytes))))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistorError::Read { path, source }),
        }
    }

    async fn save_round(
        &self,
        _: &FlContext,
        round: u32,
        artifact: &Payload,
    ) -> Result<(), PersistorError> {
        self.write(self.round_path(round), artifact).await
    }

    async fn save_final(&self, _: &FlContext, artifact: &Payload) -> Result<(), PersistorError> {
        self.write(self.final_path(), artifact).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_initial_artifact_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = FilePersistor::new(dir.path());
        let ctx = FlContext::new("test");
        assert!(persistor.load(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saves_and_loads_files() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = FilePersistor::new(dir.path().join("artifacts"));
        let ctx = FlContext::new("test");

        persistor
            .save_round(&ctx, 2, &Payload::from(vec![2]))
            .await
            .unwrap();
        persistor
            .save_final(&ctx, &Payload::from(vec![9]))
            .await
            .unwrap();
        assert_eq!(std::fs::read(persistor.round_path(2)).unwrap(), vec![2]);
        assert_eq!(std::fs::read(persistor.final_path()).unwrap(), vec![9]);

        std::fs::write(persistor.initial_path(), [7, 7]).unwrap();
        let initial = persistor.load(&ctx).await.unwrap().unwrap();
        assert_eq!(initial.as_bytes(), &[7, 7]);
    }
}
