//! Waiting for the process to be asked to stop.

use tokio_util::sync::CancellationToken;

/// Returns a `Future` that completes when the controller should abort the running job.
pub async fn shutdown() {
    imp::shutdown().await
}

/// Cancel `token` on the first shutdown signal.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown() => token.cancel(),
            () = token.cancelled() => {}
        }
    });
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            // SIGINT  - To allow Ctrl-c to emulate SIGTERM while developing.
            () = sig(SignalKind::interrupt(), "SIGINT") => {}
            () = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(
                    // use target to remove 'imp' from output
                    target: "fedbridge::signal",
                    "received {}, aborting the job",
                    name,
                );
            }
            Err(err) => {
                error!(target: "fedbridge::signal", "cannot listen to {}: {}", name, err);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "fedbridge::signal", "received Ctrl-C, aborting the job"),
            Err(err) => {
                error!(target: "fedbridge::signal", "cannot listen to Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
        }
    }
}
