//! The polling loop that decides when a job is done.

use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    common::ClientName,
    controller::{dispatcher::ClientActivity, ControllerError},
};

/// Where the monitor learns that the job finished.
pub trait CompletionProbe: Send + Sync {
    /// `Ok(true)` once the job is done, `Ok(false)` while it is still running and an error if it
    /// can never complete anymore.
    fn check(&self) -> Result<bool, ControllerError>;
}

/// Timing parameters of the monitor loop.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Time between two checks.
    pub job_status_check_interval: Duration,
    /// A client silent for longer than this fails the job.
    pub max_client_op_interval: Duration,
    /// The job fails if it is not done after this long.
    pub progress_timeout: Duration,
}

pub struct Monitor {
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Poll `probe` until it reports completion or one of the timeouts fires.
    ///
    /// Clients without any recorded activity are considered seen when the loop starts.
    pub async fn run(
        &self,
        probe: &dyn CompletionProbe,
        activity: &ClientActivity,
        clients: &[ClientName],
    ) -> Result<(), ControllerError> {
        let started = Instant::now();
        activity.seed(clients, started).await;

        let mut ticker = interval(self.config.job_status_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if probe.check()? {
                info!("job reported completion");
                return Ok(());
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(started);
            if elapsed > self.config.progress_timeout {
                warn!("no completion after {:?}", elapsed);
                return Err(ControllerError::ProgressTimeout {
                    elapsed,
                    limit: self.config.progress_timeout,
                });
            }

            if let Some((client, silent_for)) = activity.most_silent(clients, now).await {
                if silent_for > self.config.max_client_op_interval {
                    warn!(client = %client, "client silent for {:?}", silent_for);
                    return Err(ControllerError::ClientSilent { client, silent_for });
                }
            }
            debug!(elapsed = ?elapsed, "job still running");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Flag(AtomicBool);

    impl CompletionProbe for Flag {
        fn check(&self) -> Result<bool, ControllerError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct Crashed;

    impl CompletionProbe for Crashed {
        fn check(&self) -> Result<bool, ControllerError> {
            Err(ControllerError::BridgeCrashed("gone".to_string()))
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            job_status_check_interval: Duration::from_millis(20),
            max_client_op_interval: Duration::from_millis(100),
            progress_timeout: Duration::from_secs(10),
        }
    }

    fn roster() -> Vec<ClientName> {
        vec!["site-1".into(), "site-2".into()]
    }

    /// Touch `client` every 10ms until the task is aborted.
    fn keep_alive(activity: ClientActivity, client: ClientName) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                activity.touch(&client).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_probe_reports_done() {
        let probe = Arc::new(Flag::default());
        let activity = ClientActivity::new();
        let a = keep_alive(activity.clone(), "site-1".into());
        let b = keep_alive(activity.clone(), "site-2".into());

        let setter = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            setter.0.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        Monitor::new(config())
            .run(probe.as_ref(), &activity, &roster())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        a.abort();
        b.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_fails_within_one_tick() {
        let probe = Flag::default();
        let activity = ClientActivity::new();
        let start = Instant::now();
        activity.touch_at(&"site-1".into(), start).await;
        let alive = keep_alive(activity.clone(), "site-2".into());

        let err = Monitor::new(config())
            .run(&probe, &activity, &roster())
            .await
            .unwrap_err();
        let failed_at = start.elapsed();

        match err {
            ControllerError::ClientSilent { client, silent_for } => {
                assert_eq!(client.as_str(), "site-1");
                assert!(silent_for > Duration::from_millis(100));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // T = 100ms, one tick = 20ms
        assert!(failed_at <= Duration::from_millis(120));
        alive.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn progress_timeout_fires() {
        let mut config = config();
        config.progress_timeout = Duration::from_millis(200);
        let activity = ClientActivity::new();
        let a = keep_alive(activity.clone(), "site-1".into());
        let b = keep_alive(activity.clone(), "site-2".into());

        let err = Monitor::new(config)
            .run(&Flag::default(), &activity, &roster())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ProgressTimeout { .. }));
        a.abort();
        b.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_are_fatal() {
        let err = Monitor::new(config())
            .run(&Crashed, &ClientActivity::new(), &roster())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::BridgeCrashed(_)));
    }
}
