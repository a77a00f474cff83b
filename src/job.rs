//! Running a workflow from start to end.

use derive_more::Display;
use tokio_util::sync::CancellationToken;
use tracing::{error, error_span, info, warn, Instrument};

use crate::{
    common::FlContext,
    controller::{Controller, ControllerError},
};

/// The phases of a job.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Configure")]
    Configure,
    #[display(fmt = "Start")]
    Start,
    #[display(fmt = "Monitor")]
    Monitor,
    #[display(fmt = "Finalize")]
    Finalize,
}

/// How a job ended.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum JobStatus {
    #[display(fmt = "succeeded")]
    Succeeded,
    #[display(fmt = "failed in phase {}: {}", phase, reason)]
    Failed { phase: PhaseName, reason: String },
    /// The job was cancelled from outside while in `phase`.
    #[display(fmt = "aborted in phase {}", phase)]
    Aborted { phase: PhaseName },
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }
}

/// A job: one controller and the context it runs in.
pub struct Job<C> {
    ctx: FlContext,
    controller: C,
}

impl<C> Job<C>
where
    C: Controller,
{
    pub fn new(ctx: FlContext, controller: C) -> Self {
        Self { ctx, controller }
    }

    pub fn context(&self) -> &FlContext {
        &self.ctx
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn into_controller(self) -> C {
        self.controller
    }

    /// Run the job to its end.
    pub async fn run(&mut self) -> JobStatus {
        self.run_until(&CancellationToken::new()).await
    }

    /// Run the configure, start and monitor phases until one of them fails or `cancel` fires,
    /// then finalize.
    ///
    /// Finalization always runs. Its failure only decides the status of an otherwise successful
    /// job.
    pub async fn run_until(&mut self, cancel: &CancellationToken) -> JobStatus {
        info!(
            job = %self.ctx.job_id,
            name = %self.ctx.job_name,
            workflow = self.controller.name(),
            "starting job"
        );

        let mut status = JobStatus::Succeeded;
        for phase in [PhaseName::Configure, PhaseName::Start, PhaseName::Monitor] {
            let span = error_span!("run_phase", phase = %phase);
            let outcome = tokio::select! {
                outcome = self.run_phase(phase).instrument(span) => outcome,
                _ = cancel.cancelled() => {
                    warn!("job cancelled during phase {}", phase);
                    status = JobStatus::Aborted { phase };
                    break;
                }
            };
            if let Err(err) = outcome {
                error!("phase {} failed: {}", phase, err);
                status = JobStatus::Failed {
                    phase,
                    reason: err.to_string(),
                };
                break;
            }
        }

        let span = error_span!("run_phase", phase = %PhaseName::Finalize);
        if let Err(err) = self.run_phase(PhaseName::Finalize).instrument(span).await {
            error!("finalization failed: {}", err);
            if status.is_success() {
                status = JobStatus::Failed {
                    phase: PhaseName::Finalize,
                    reason: err.to_string(),
                };
            }
        }

        info!(job = %self.ctx.job_id, "job {}", status);
        status
    }

    async fn run_phase(&mut self, phase: PhaseName) -> Result<(), ControllerError> {
        info!("phase started");
        let ctx = &self.ctx;
        let outcome = match phase {
            PhaseName::Configure => self.controller.configure(ctx).await,
            PhaseName::Start => self.controller.start(ctx).await,
            PhaseName::Monitor => self.controller.monitor(ctx).await,
            PhaseName::Finalize => self.controller.finalize(ctx).await,
        };
        if outcome.is_ok() {
            info!("phase completed");
        }
        outcome
    }
}
