use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::handler::ConnectionHandler;
use crate::router::Router;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

struct RunningState {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    cancel: CancellationToken,
    force: CancellationToken,
}

/// Owns the listening socket and the Stopped/Running lifecycle. At most one
/// accept loop exists while running; `start`/`stop` serialize on the state
/// lock so concurrent calls cannot double-bind or tear state.
pub struct ProxyServer {
    handler: Arc<ConnectionHandler>,
    settings: ServerSettings,
    state: Mutex<Option<RunningState>>,
    running: AtomicBool,
}

impl ProxyServer {
    pub fn new(settings: ServerSettings, router: Arc<Router>) -> Self {
        Self {
            handler: Arc::new(ConnectionHandler::new(router, settings.idle_timeout)),
            settings,
            state: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Bind and begin accepting connections. Calling while already running is
    /// a logged no-op; a bind failure is returned and the state stays Stopped.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            info!("Already running");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(&self.settings.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            cancel.clone(),
            force.clone(),
        ));

        *state = Some(RunningState {
            local_addr,
            accept_task,
            cancel,
            force,
        });
        self.running.store(true, Ordering::SeqCst);
        info!("Start service on {local_addr}...");
        Ok(local_addr)
    }

    /// Graceful shutdown: stop accepting, let in-flight connections finish up
    /// to the grace deadline, then force-close the rest. Always ends Stopped.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };

        running.cancel.cancel();
        let mut accept_task = running.accept_task;
        match timeout(self.settings.shutdown_grace, &mut accept_task).await {
            Ok(Err(e)) => error!("accept loop task failed during shutdown: {e}"),
            Ok(Ok(())) => {}
            Err(_) => {
                warn!(
                    "shutdown deadline of {:?} elapsed, closing remaining connections",
                    self.settings.shutdown_grace
                );
                running.force.cancel();
                if let Err(e) = accept_task.await {
                    error!("accept loop task failed during forced shutdown: {e}");
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Stop service...");
    }

    /// Safe to call from any concurrent context.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|s| s.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    cancel: CancellationToken,
    force: CancellationToken,
) {
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    let force = force.clone();
                    workers.spawn(async move {
                        tokio::select! {
                            _ = force.cancelled() => {}
                            _ = handler.handle(stream, peer) => {}
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {e}");
                }
            },
        }
        // reap finished workers without blocking the accept loop
        while workers.try_join_next().is_some() {}
    }
    drop(listener);
    // in-flight connections drain here; stop() bounds the wait and trips the
    // force token once the deadline elapses
    while workers.join_next().await.is_some() {}
}
