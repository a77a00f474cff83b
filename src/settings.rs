//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `FEDBRIDGE__`, e.g. `FEDBRIDGE__BRIDGE__AGGR_TIMEOUT=0.5`. Examples of configuration files
//! can be found in the `configs/` directory located in the repository root. Durations are given in
//! seconds.

use std::{collections::HashMap, fmt, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

use crate::{
    adaptor::AdaptorConfig,
    common::ClientName,
    controller::{BridgeControllerConfig, CyclicConfig, RelayOrder},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    #[validate]
    pub job: JobSettings,
    #[validate]
    #[serde(default)]
    pub cyclic: CyclicSettings,
    #[validate]
    #[serde(default)]
    pub bridge: BridgeSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Environment::with_prefix("fedbridge").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Which workflow a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Cyclic,
    Bridge,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The job settings.
pub struct JobSettings {
    /// The name of the job.
    pub name: String,
    /// The workflow to run.
    pub workflow: Workflow,
    /// The participating sites, in roster order.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [job]
    /// clients = ["site-1", "site-2"]
    /// ```
    #[validate(length(min = 1))]
    pub clients: Vec<String>,
    /// The workspace of the job.
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
}

impl JobSettings {
    pub fn roster(&self) -> Vec<ClientName> {
        self.clients.iter().map(ClientName::new).collect()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[serde(default)]
/// The cyclic workflow settings.
pub struct CyclicSettings {
    /// How many clients of the roster take part in the relay.
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// How many times the artifact goes around.
    #[validate(range(min = 1))]
    pub num_rounds: u32,
    /// The name of the task sent to each client.
    pub task_name: String,
    /// How long a client may take to return the artifact.
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub task_timeout: f64,
    /// The relay order.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cyclic]
    /// order = { kind = "random_without_same_in_a_row", seed = 42 }
    /// ```
    pub order: RelayOrder,
    /// Save the artifact every that many rounds, `0` to only save the final artifact.
    pub persist_every_n_rounds: u32,
    /// Where artifacts are stored. Nothing is persisted if not set.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for CyclicSettings {
    fn default() -> Self {
        let defaults = CyclicConfig::default();
        Self {
            num_clients: defaults.num_clients,
            num_rounds: defaults.num_rounds,
            task_name: defaults.task_name,
            task_timeout: defaults.task_timeout.as_secs_f64(),
            order: defaults.order,
            persist_every_n_rounds: defaults.persist_every_n_rounds,
            artifact_dir: None,
        }
    }
}

impl CyclicSettings {
    pub fn controller_config(&self) -> CyclicConfig {
        CyclicConfig {
            num_clients: self.num_clients,
            num_rounds: self.num_rounds,
            task_name: self.task_name.clone(),
            task_timeout: seconds(self.task_timeout),
            order: self.order,
            persist_every_n_rounds: self.persist_every_n_rounds,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[serde(default)]
/// The bridge workflow settings.
pub struct BridgeSettings {
    #[validate(range(min = 1))]
    pub num_rounds: u32,
    pub split_mode: u32,
    pub secure_training: bool,
    /// Parameters of the external engine, forwarded to the clients as they are.
    pub params: serde_json::Value,
    pub configure_task_name: String,
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub configure_task_timeout: f64,
    pub start_task_name: String,
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub start_task_timeout: f64,
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub job_status_check_interval: f64,
    /// A client silent for longer than this fails the job.
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub max_client_op_interval: f64,
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub progress_timeout: f64,
    /// Explicit ranks of the clients. Keys are read lowercased.
    pub client_ranks: Option<HashMap<String, u32>>,
    /// Upper bound of a single aggregation call.
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub aggr_timeout: f64,
    /// Serve the bridge in process or over TCP.
    pub in_process: bool,
    pub bind_address: SocketAddr,
    #[validate(range(min = 1024))]
    pub max_frame_length: usize,
    #[validate(range(min = 0.001, max = 31536000.0))]
    pub shutdown_grace: f64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let controller = BridgeControllerConfig::default();
        let adaptor = AdaptorConfig::default();
        Self {
            num_rounds: controller.num_rounds,
            split_mode: controller.split_mode,
            secure_training: controller.secure_training,
            params: controller.params,
            configure_task_name: controller.configure_task_name,
            configure_task_timeout: controller.configure_task_timeout.as_secs_f64(),
            start_task_name: controller.start_task_name,
            start_task_timeout: controller.start_task_timeout.as_secs_f64(),
            job_status_check_interval: controller.job_status_check_interval.as_secs_f64(),
            max_client_op_interval: controller.max_client_op_interval.as_secs_f64(),
            progress_timeout: controller.progress_timeout.as_secs_f64(),
            client_ranks: None,
            aggr_timeout: 10.0,
            in_process: adaptor.in_process,
            bind_address: adaptor.bind_address,
            max_frame_length: adaptor.max_frame_length,
            shutdown_grace: adaptor.shutdown_grace.as_secs_f64(),
        }
    }
}

impl BridgeSettings {
    pub fn controller_config(&self) -> BridgeControllerConfig {
        BridgeControllerConfig {
            num_rounds: self.num_rounds,
            split_mode: self.split_mode,
            secure_training: self.secure_training,
            params: self.params.clone(),
            configure_task_name: self.configure_task_name.clone(),
            configure_task_timeout: seconds(self.configure_task_timeout),
            start_task_name: self.start_task_name.clone(),
            start_task_timeout: seconds(self.start_task_timeout),
            job_status_check_interval: seconds(self.job_status_check_interval),
            max_client_op_interval: seconds(self.max_client_op_interval),
            progress_timeout: seconds(self.progress_timeout),
            client_ranks: self.client_ranks.as_ref().map(|ranks| {
                ranks
                    .iter()
                    .map(|(client, rank)| (ClientName::new(client.as_str()), *rank))
                    .collect()
            }),
        }
    }

    pub fn adaptor_config(&self) -> AdaptorConfig {
        AdaptorConfig {
            in_process: self.in_process,
            bind_address: self.bind_address,
            max_frame_length: self.max_frame_length,
            shutdown_grace: seconds(self.shutdown_grace),
        }
    }

    pub fn aggr_timeout(&self) -> Duration {
        seconds(self.aggr_timeout)
    }
}

/// Durations are validated to lie between a millisecond and a year, which always fits.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDBRIDGE__LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
