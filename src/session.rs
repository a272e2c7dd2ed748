//! One relayed connection: the accepted client socket, the socket opened to
//! the destination, and the two tasks copying bytes between them.
//!
//! Whichever direction stops first (peer closed, I/O error, or a forced
//! [`RelaySession::close`]) wins the teardown: it alone logs the close and
//! fires the disconnect notification. Both directions then release their
//! socket halves, after which [`RelaySession::closed`] resolves.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use serde::Serialize;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, trace_span, Instrument};
use tracing_error::{InstrumentError, TracedError};
use uuid::Uuid;

use crate::{config::schema::RelayOptions, log::Logger, task::spawn};

const COMPONENT: &str = "RelaySession";

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Active,
    Terminating,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "metrics",
    derive(prometheus_client::encoding::EncodeLabelValue)
)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToDestination => write!(f, "client->destination"),
            Direction::DestinationToClient => write!(f, "destination->client"),
        }
    }
}

type DisconnectCallback = Box<dyn FnOnce(SessionId) + Send>;

enum Disconnect {
    Pending(Vec<DisconnectCallback>),
    Fired,
}

pub struct RelaySession {
    id: SessionId,
    connection_string: String,
    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    opened_at: Instant,

    /// destination -> client
    bytes_in: AtomicU64,
    /// client -> destination
    bytes_out: AtomicU64,

    /// Directions that have stopped copying. Only the first one reports.
    terminations: AtomicUsize,
    /// Directions that have dropped their socket halves.
    released: AtomicUsize,

    shutdown: CancellationToken,
    closed: CancellationToken,
    disconnect: Mutex<Disconnect>,

    logger: Logger,
    #[cfg(feature = "metrics")]
    metrics: crate::metrics::RelayMetrics,
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("connection", &self.connection_string)
            .field("bytes_in", &self.bytes_in())
            .field("bytes_out", &self.bytes_out())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.connection_string())
    }
}

/// Point in time view of a session, as served by the status endpoint.
#[cfg_attr(not(feature = "ui"), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub connection: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub state: SessionState,
    pub age_secs: u64,
}

impl RelaySession {
    /// Connect to `destination` on behalf of `client` and start relaying.
    ///
    /// Both copy loops are running by the time this returns. If the
    /// destination cannot be reached the client socket is dropped and no
    /// session exists.
    #[tracing::instrument(name = "open_session", skip_all, fields(%destination))]
    pub async fn open(
        client: TcpStream,
        destination: SocketAddr,
        options: &RelayOptions,
        logger: Logger,
        #[cfg(feature = "metrics")] metrics: crate::metrics::RelayMetrics,
    ) -> Result<Arc<Self>, TracedError<io::Error>> {
        let server = match timeout(options.connect_timeout(), TcpStream::connect(destination))
            .instrument(trace_span!("connect_destination"))
            .await
        {
            Ok(result) => result.map_err(InstrumentError::in_current_span)?,
            Err(_) => {
                return Err(InstrumentError::in_current_span(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out connecting to {destination}"),
                )))
            }
        };
        trace!("connected to destination");

        let connection_string = format!(
            "{} -> {} -> {}",
            client
                .peer_addr()
                .map_err(InstrumentError::in_current_span)?,
            server
                .local_addr()
                .map_err(InstrumentError::in_current_span)?,
            server
                .peer_addr()
                .map_err(InstrumentError::in_current_span)?,
        );

        let session = Arc::new(RelaySession {
            id: Uuid::new_v4(),
            connection_string,
            opened_at: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            terminations: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            disconnect: Mutex::new(Disconnect::Pending(Vec::new())),
            logger,
            #[cfg(feature = "metrics")]
            metrics,
        });

        session
            .logger
            .information(COMPONENT, format_args!("Open: {session}"));
        #[cfg(feature = "metrics")]
        session.metrics.active_sessions.inc();

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();
        let span = trace_span!("session", id = %session.id);

        spawn(
            "client_to_destination",
            session
                .clone()
                .pump(
                    client_read,
                    server_write,
                    Direction::ClientToDestination,
                    options.buffer_size,
                )
                .instrument(span.clone()),
        );
        spawn(
            "destination_to_client",
            session
                .clone()
                .pump(
                    server_read,
                    client_write,
                    Direction::DestinationToClient,
                    options.buffer_size,
                )
                .instrument(span),
        );

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Bytes forwarded from the destination to the client.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Acquire)
    }

    /// Bytes forwarded from the client to the destination.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.released.load(Ordering::Acquire) == 2 {
            SessionState::Closed
        } else if self.terminations.load(Ordering::Acquire) > 0 {
            SessionState::Terminating
        } else {
            SessionState::Active
        }
    }

    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            connection: self.connection_string().to_owned(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            state: self.state(),
            age_secs: self.opened_at.elapsed().as_secs(),
        }
    }

    /// Register `callback` to run once when the session terminates.
    ///
    /// A session that already terminated runs the callback immediately on
    /// the calling task.
    pub fn on_disconnect(&self, callback: impl FnOnce(SessionId) + Send + 'static) {
        let mut disconnect = self
            .disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Disconnect::Pending(callbacks) = &mut *disconnect {
            callbacks.push(Box::new(callback));
            return;
        }

        drop(disconnect);
        callback(self.id);
    }

    /// Force both legs closed. The copy loops observe this as an error and
    /// tear the session down through the usual path.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once both copy loops have stopped and released their sockets.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToDestination => &self.bytes_out,
            Direction::DestinationToClient => &self.bytes_in,
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut source: OwnedReadHalf,
        mut sink: OwnedWriteHalf,
        direction: Direction,
        buffer_size: usize,
    ) {
        let mut buffer = vec![0u8; buffer_size.max(1)];

        let result = loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break Err(closed_locally()),
                read = source.read(&mut buffer) => read,
            };

            let count = match read {
                Ok(0) => break Ok(()),
                Ok(count) => count,
                Err(error) => break Err(error),
            };

            let written = tokio::select! {
                _ = self.shutdown.cancelled() => break Err(closed_locally()),
                written = sink.write_all(&buffer[..count]) => written,
            };
            if let Err(error) = written {
                break Err(error);
            }

            self.counter(direction)
                .fetch_add(count as u64, Ordering::AcqRel);
            #[cfg(feature = "metrics")]
            self.metrics
                .bytes_relayed
                .get_or_create(&crate::metrics::DirectionLabels { direction })
                .inc_by(count as u64);
            trace!(%direction, count, "forwarded");
        };

        self.terminate(direction, result);

        drop(source);
        drop(sink);

        if self.released.fetch_add(1, Ordering::AcqRel) + 1 == 2 {
            debug!(
                bytes_in = self.bytes_in(),
                bytes_out = self.bytes_out(),
                "session released"
            );
            self.closed.cancel();
        }
    }

    fn terminate(&self, direction: Direction, result: io::Result<()>) {
        let terminations = self.terminations.fetch_add(1, Ordering::AcqRel) + 1;

        if terminations != 1 {
            trace!(%direction, ?result, "direction stopped after teardown");
            return;
        }

        match &result {
            Ok(()) => self.logger.information(
                COMPONENT,
                format_args!("Close: {self} closed gracefully"),
            ),
            Err(error) => self
                .logger
                .error(COMPONENT, format_args!("Error: {self} closed: {error}")),
        }

        #[cfg(feature = "metrics")]
        {
            use crate::metrics::{CloseLabels, CloseOutcome};

            let outcome = match result {
                Ok(()) => CloseOutcome::Graceful,
                Err(_) => CloseOutcome::Error,
            };
            self.metrics
                .sessions_closed
                .get_or_create(&CloseLabels { outcome })
                .inc();
            self.metrics.active_sessions.dec();
        }

        // Unblocks the other direction
        self.shutdown.cancel();

        let callbacks = match std::mem::replace(
            &mut *self
                .disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            Disconnect::Fired,
        ) {
            Disconnect::Pending(callbacks) => callbacks,
            Disconnect::Fired => Vec::new(),
        };

        for callback in callbacks {
            callback(self.id);
        }
    }
}

fn closed_locally() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "relay closed locally")
}
