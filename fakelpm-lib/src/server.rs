//! TCP front end: accepts connections and runs one session per connection.

use crate::clock::{Clock, SystemClock};
use crate::config::{ServerConfig, SessionConfig};
use crate::error::LpmError;
use crate::frame::ControlFrame;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::session::{Phase, ServerSession, SessionSummary};
use crate::source::{MeasurementSource, RandomSource};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct LpmServer {
    listener: TcpListener,
    config: ServerConfig,
    source: Arc<dyn MeasurementSource>,
    clock: Arc<dyn Clock>,
    registry: Arc<ConnectionRegistry>,
    stop: Arc<watch::Sender<bool>>,
}

/// Stops a running [`LpmServer`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<watch::Sender<bool>>,
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownHandle {
    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        let closed = self.registry.close_all();
        info!("Shutdown requested, closed {} connections", closed);
    }
}

impl LpmServer {
    /// Bind the listener. Sessions stream random payloads stamped with the
    /// configured zone until another source or clock is set.
    pub async fn bind(config: ServerConfig) -> Result<Self, LpmError> {
        let listener = TcpListener::bind(config.bind).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.zone));
        let (stop, _) = watch::channel(false);
        Ok(Self {
            listener,
            config,
            source: Arc::new(RandomSource::new(clock.clone())),
            clock,
            registry: Arc::new(ConnectionRegistry::new()),
            stop: Arc::new(stop),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn MeasurementSource>) -> Self {
        self.source = source;
        self
    }

    /// Clock used for header timestamps. The current source is kept.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LpmError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Accept connections until shutdown is requested.
    ///
    /// The stop signal is raced against `accept`, so a quiet listener does
    /// not delay shutdown. Connections still open when the loop ends are
    /// closed before returning.
    pub async fn run(self) -> Result<(), LpmError> {
        let mut stop = self.stop.subscribe();
        info!("Server started on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_session(stream, peer),
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        let closed = self.registry.close_all();
        info!("Server stopped, closed {} connections", closed);
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        info!("Connection accepted from {}", peer);
        let registry = self.registry.clone();
        let source = self.source.clone();
        let clock = self.clock.clone();
        let config = self.config.session;

        self.registry.register(peer, move |id| {
            let span = info_span!("conn", id, %peer);
            tokio::spawn(
                async move {
                    report(id, serve(stream, config, source, clock).await);
                    registry.deregister(id);
                }
                .instrument(span),
            )
        });
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Greet the client, then run the download handshake.
async fn serve(
    mut stream: TcpStream,
    config: SessionConfig,
    source: Arc<dyn MeasurementSource>,
    clock: Arc<dyn Clock>,
) -> Result<SessionSummary, LpmError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle: {}", e);
    }
    stream
        .write_all(ControlFrame::Ack.as_bytes())
        .await
        .map_err(|e| LpmError::from(e).in_phase(Phase::Greeting))?;

    ServerSession::new(stream, config, source, clock).run().await
}

fn report(id: ConnectionId, outcome: Result<SessionSummary, LpmError>) {
    match outcome {
        Ok(summary) => info!(
            "Session {} finished {} download: {} records, {} NAKs",
            id, summary.command, summary.records_sent, summary.naks_sent
        ),
        Err(e) if e.is_timeout() => warn!("Session {} timed out: {}", id, e),
        Err(e) => warn!("Session {} closed: {}", id, e),
    }
}
