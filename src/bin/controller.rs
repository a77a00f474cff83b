use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use fedbridge::{
    common::{ClientName, FlContext, Payload},
    controller::{
        persistor::FilePersistor,
        BridgeController,
        CyclicController,
        Dispatcher,
        LocalChannel,
    },
    job::{Job, JobStatus},
    runner::mock::MockAdaptorFactory,
    settings::{BridgeSettings, CyclicSettings, Settings, Workflow},
    signal,
    simulation::{BridgeSiteExecutor, ConnectorSlot, CounterExecutor, PublishingFactory},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "fedbridge-controller")]
/// Runs a simulated job: the client sites live in this process.
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(settings.log.filter)
        .with_ansi(true)
        .init();

    let mut ctx = FlContext::new(settings.job.name.as_str());
    if let Some(run_dir) = &settings.job.run_dir {
        ctx = ctx.with_run_dir(run_dir);
    }
    let roster = settings.job.roster();

    let cancel = CancellationToken::new();
    signal::cancel_on_shutdown(cancel.clone());

    let outcome = match settings.job.workflow {
        Workflow::Cyclic => run_cyclic(ctx, roster, &settings.cyclic, &cancel).await,
        Workflow::Bridge => run_bridge(ctx, roster, &settings.bridge, &cancel).await,
    };
    cancel.cancel();

    match outcome {
        Ok(JobStatus::Succeeded) => info!("job succeeded"),
        Ok(status) => {
            error!("job {}", status);
            process::exit(1);
        }
        Err(err) => {
            error!("{:#}", err);
            process::exit(1);
        }
    }
}

async fn run_cyclic(
    ctx: FlContext,
    roster: Vec<ClientName>,
    settings: &CyclicSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<JobStatus> {
    let channel = roster.iter().fold(LocalChannel::new(), |channel, site| {
        channel.with_executor(site.clone(), Arc::new(CounterExecutor::new(site.clone())))
    });
    let initial = Payload::encode(&0u64).context("failed to encode the initial counter")?;

    let mut controller = CyclicController::new(
        settings.controller_config(),
        Dispatcher::new(Arc::new(channel)),
        roster,
        initial,
    );
    if let Some(dir) = &settings.artifact_dir {
        controller = controller.with_persistor(Arc::new(FilePersistor::new(dir)));
    }

    let mut job = Job::new(ctx, controller);
    let status = job.run_until(cancel).await;
    if status.is_success() {
        let counter: u64 = job
            .controller()
            .artifact()
            .decode()
            .context("the final artifact is not a counter")?;
        info!(counter, "final artifact");
    }
    Ok(status)
}

async fn run_bridge(
    ctx: FlContext,
    roster: Vec<ClientName>,
    settings: &BridgeSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<JobStatus> {
    let config = settings.controller_config();
    let adaptor = settings.adaptor_config();
    let slot = ConnectorSlot::default();

    let sites: Vec<Arc<BridgeSiteExecutor>> = roster
        .iter()
        .map(|site| {
            Arc::new(
                BridgeSiteExecutor::new(
                    site.clone(),
                    config.configure_task_name.as_str(),
                    config.start_task_name.as_str(),
                )
                .with_connector_slot(slot.clone())
                .with_max_frame_length(adaptor.max_frame_length)
                .with_aggr_timeout(settings.aggr_timeout()),
            )
        })
        .collect();
    let channel = roster
        .iter()
        .zip(&sites)
        .fold(LocalChannel::new(), |channel, (site, executor)| {
            channel.with_executor(site.clone(), executor.clone())
        });

    let mut factory = MockAdaptorFactory::new(settings.aggr_timeout());
    factory.adaptor = adaptor;
    let controller = BridgeController::new(
        config,
        Dispatcher::new(Arc::new(channel)),
        roster,
        Arc::new(PublishingFactory::new(factory, slot)),
    );

    let status = Job::new(ctx, controller).run_until(cancel).await;
    for site in &sites {
        if let Some(Err(err)) = site.join().await {
            error!("a simulated site failed: {}", err);
        }
    }
    Ok(status)
}
