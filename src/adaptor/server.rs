//! Accept loops of the bridge server and the driving of its connections.

use std::{io, net::SocketAddr, sync::Arc, thread};

use futures::StreamExt;
use tarpc::{
    serde_transport::tcp,
    server::{BaseChannel, Channel},
    tokio_serde::formats::Json,
    transport::channel::UnboundedChannel,
    ClientMessage,
    Response,
    Transport,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

use crate::adaptor::{
    connections::Connection,
    rpc::{Bridge, BridgeHandler, BridgeRequest, BridgeResponse, BridgeState},
    AdaptorStatus,
};

/// Server end of an in-memory connection.
pub(crate) type LocalTransport =
    UnboundedChannel<ClientMessage<BridgeRequest>, Response<BridgeResponse>>;

/// Marks the server as crashed if it goes away without being asked to, and signals its end.
struct ServerGuard {
    state: Arc<BridgeState>,
    _done: oneshot::Sender<()>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        let reason = if thread::panicking() {
            "bridge server panicked"
        } else {
            "bridge server exited unexpectedly"
        };
        let crashed = self.state.status.send_if_modified(|status| {
            if *status == AdaptorStatus::Running {
                *status = AdaptorStatus::Crashed(reason.to_string());
                true
            } else {
                false
            }
        });
        if crashed {
            error!("{}", reason);
        }
    }
}

/// Serve one connection until the client goes away or the server force-closes it.
pub(crate) async fn serve_connection<T>(state: Arc<BridgeState>, transport: T)
where
    T: Transport<Response<BridgeResponse>, ClientMessage<BridgeRequest>> + Send + 'static,
{
    let conn = Arc::new(Connection::new());
    debug!(conn = %conn.id, "connection accepted");

    let handler = BridgeHandler::new(state.clone(), conn.clone());
    let calls = state.calls.clone();
    let requests = BaseChannel::with_defaults(transport)
        .execute(handler.serve())
        .for_each_concurrent(None, |call| calls.track_future(call));

    // polling the requests first writes out the responses of drained calls before closing
    select! {
        biased;
        _ = requests => debug!(conn = %conn.id, "connection closed by the client"),
        _ = state.force_close.cancelled() => debug!(conn = %conn.id, "connection force-closed"),
    }
    state.release(&conn).await;
}

/// Accept in-memory connections until a stop is requested.
pub(crate) async fn run_local(
    state: Arc<BridgeState>,
    mut incoming: mpsc::UnboundedReceiver<LocalTransport>,
    done: oneshot::Sender<()>,
) {
    let guard = ServerGuard {
        state: state.clone(),
        _done: done,
    };
    info!("bridge server accepting in-process connections");

    loop {
        select! {
            _ = state.shutdown.cancelled() => break,
            next = incoming.recv() => match next {
                Some(transport) => {
                    state.drivers.spawn(serve_connection(state.clone(), transport));
                }
                None => {
                    warn!("in-process connector closed");
                    break;
                }
            },
        }
    }
    drop(incoming);

    state.drivers.close();
    state.drivers.wait().await;
    drop(guard);
}

/// Accept TCP connections on `address` until a stop is requested.
async fn run_tcp(
    state: Arc<BridgeState>,
    address: SocketAddr,
    max_frame_length: usize,
    bound: oneshot::Sender<io::Result<SocketAddr>>,
    done: oneshot::Sender<()>,
) {
    let mut listener = match tcp::listen(address, Json::default).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = bound.send(Err(err));
            return;
        }
    };
    listener.config_mut().max_frame_length(max_frame_length);
    let local_addr = listener.local_addr();

    let guard = ServerGuard {
        state: state.clone(),
        _done: done,
    };
    if bound.send(Ok(local_addr)).is_err() {
        // nobody waits for the server anymore
        state.shutdown.cancel();
        return;
    }
    info!(address = %local_addr, "bridge server listening");

    loop {
        select! {
            _ = state.shutdown.cancelled() => break,
            next = listener.next() => match next {
                Some(Ok(transport)) => {
                    state.drivers.spawn(serve_connection(state.clone(), transport));
                }
                Some(Err(err)) => warn!("failed to accept a connection: {}", err),
                None => {
                    error!("listener closed");
                    break;
                }
            },
        }
    }

    state.drivers.close();
    state.drivers.wait().await;
    drop(guard);
}

/// Serve TCP from a dedicated thread with its own runtime, so that the server keeps answering
/// whatever the caller's runtime is busy with.
///
/// Resolves once the listener is bound, with its actual address.
pub(crate) async fn spawn_tcp(
    state: Arc<BridgeState>,
    address: SocketAddr,
    max_frame_length: usize,
    done: oneshot::Sender<()>,
) -> io::Result<SocketAddr> {
    let (bound_tx, bound_rx) = oneshot::channel();
    thread::Builder::new()
        .name("bridge-server".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .thread_name("bridge-worker")
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return;
                }
            };
            runtime.block_on(run_tcp(state, address, max_frame_length, bound_tx, done));
        })?;

    bound_rx.await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::Other,
            "bridge server thread ended before binding",
        )
    })?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::{
        adaptor::connections::RankTable,
        common::ClientName,
        controller::ClientActivity,
        runner::mock::MockRunner,
    };

    fn state() -> (Arc<BridgeState>, watch::Receiver<AdaptorStatus>) {
        let (tx, rx) = watch::channel(AdaptorStatus::Running);
        let ranks = RankTable::in_roster_order(&[ClientName::from("site-1")]).unwrap();
        let state = BridgeState::new(
            Arc::new(MockRunner::new(Duration::from_secs(1))),
            ranks,
            ClientActivity::new(),
            Arc::new(tx),
        );
        (Arc::new(state), rx)
    }

    #[tokio::test]
    async fn unexpected_exit_is_a_crash() {
        let (state, status) = state();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_local(state, incoming_rx, done_tx));

        drop(incoming_tx);
        assert!(done_rx.await.is_err());
        assert!(matches!(*status.borrow(), AdaptorStatus::Crashed(_)));
    }

    #[tokio::test]
    async fn requested_exit_is_not_a_crash() {
        let (state, status) = state();
        let (_incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_local(state.clone(), incoming_rx, done_tx));

        state.shutdown.cancel();
        assert!(done_rx.await.is_err());
        assert_eq!(*status.borrow(), AdaptorStatus::Running);
    }
}
