//! Owns the listening socket and the lifecycle of every relay session.
//!
//! `start` resolves the destination, binds the listener and hands it to the
//! accept loop task. Each accepted client becomes a [`RelaySession`] that is
//! tracked until its disconnect notification removes it again. `stop`
//! cancels the accept loop, which drops (and so closes) the listener, then
//! forces every remaining session closed.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use serde::Serialize;
use sockrelay_model::{Destination, Severity};
use tokio::{
    io,
    net::{lookup_host, TcpListener, TcpSocket, TcpStream},
    sync::{self, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace_span, Instrument};

use crate::{
    config::schema::RelayOptions,
    log::Logger,
    session::{RelaySession, SessionId, SessionState},
    task::spawn,
};

const COMPONENT: &str = "Controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerStatus {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

struct Shared {
    listen_port: u16,
    destination: Destination,
    options: RelayOptions,
    logger: Logger,

    status: watch::Sender<ControllerStatus>,
    sessions: Mutex<HashMap<SessionId, Arc<RelaySession>>>,
    local_addr: Mutex<Option<SocketAddr>>,

    #[cfg(feature = "metrics")]
    metrics: crate::metrics::RelayMetrics,
}

impl Shared {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<RelaySession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_local_addr(&self, address: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Add `session` to the live set until its disconnect takes it back out.
    /// A session that already terminated is never listed.
    fn track(self: &Arc<Self>, session: Arc<RelaySession>) {
        let shared: Weak<Shared> = Arc::downgrade(self);
        session.on_disconnect(move |id| {
            if let Some(shared) = shared.upgrade() {
                shared.sessions().remove(&id);
            }
        });

        // Teardown counts the termination before notifying, and the removal
        // above blocks on this guard, so it always lands after the insert.
        let mut sessions = self.sessions();
        if session.state() == SessionState::Active {
            sessions.insert(session.id(), session);
        }
    }
}

/// Where the accept loop takes its clients from.
pub(crate) trait Incoming: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Incoming for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

struct AcceptLoop {
    cancel: CancellationToken,
    finished: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct Controller {
    shared: Arc<Shared>,
    /// Serializes `start` and `stop`. Holds the accept loop once spawned.
    lifecycle: sync::Mutex<Option<AcceptLoop>>,
}

impl Controller {
    /// Stores the configuration only. Nothing is resolved or bound until
    /// [`Controller::start`].
    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    pub fn new(listen_port: u16, destination: Destination, logger: Logger) -> Self {
        Controller::with_options(listen_port, destination, RelayOptions::default(), logger)
    }

    pub fn with_options(
        listen_port: u16,
        destination: Destination,
        options: RelayOptions,
        logger: Logger,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::NotStarted);

        logger.verbose(COMPONENT, "Initialised");

        Controller {
            shared: Arc::new(Shared {
                listen_port,
                destination,
                options,
                logger,
                status,
                sessions: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                #[cfg(feature = "metrics")]
                metrics: crate::metrics::RelayMetrics::default(),
            }),
            lifecycle: sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.shared.status.subscribe()
    }

    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    /// The address the listener is bound to while the accept loop runs.
    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the live session set. Sessions in it may close at any time.
    pub fn open_connections(&self) -> Vec<Arc<RelaySession>> {
        self.shared.sessions().values().cloned().collect()
    }

    #[cfg(feature = "metrics")]
    #[cfg_attr(not(feature = "ui"), allow(dead_code))]
    pub fn metrics(&self) -> &crate::metrics::RelayMetrics {
        &self.shared.metrics
    }

    /// Resolve the destination, bind the listener and spawn the accept loop.
    ///
    /// Failures are logged as critical and leave the status at `Starting`;
    /// callers check [`Controller::status`] afterwards. A controller whose
    /// accept loop failed can be started again.
    pub async fn start(&self) {
        self.start_with(|listener| listener).await
    }

    pub(crate) async fn start_with<I: Incoming>(&self, incoming: impl FnOnce(TcpListener) -> I) {
        let mut lifecycle = self.lifecycle.lock().await;
        let logger = &self.shared.logger;

        let status = self.status();
        let startable = match status {
            ControllerStatus::NotStarted | ControllerStatus::Starting => lifecycle.is_none(),
            ControllerStatus::Error => true,
            ControllerStatus::Running | ControllerStatus::Stopping | ControllerStatus::Stopped => {
                false
            }
        };
        if !startable {
            logger.log(
                Severity::Warning,
                COMPONENT,
                format_args!("Start ignored, controller is {status:?}"),
            );
            return;
        }

        // The loop that failed has already returned
        if let Some(task) = lifecycle.take().and_then(|previous| previous.task) {
            if let Err(error) = task.await {
                logger.error(COMPONENT, format_args!("Accept loop failed: {error}"));
            }
        }

        logger.verbose(COMPONENT, "Starting");
        self.shared.status.send_replace(ControllerStatus::Starting);

        let destination = match self.resolve().await {
            Ok(destination) => destination,
            Err(error) => {
                logger.critical(
                    COMPONENT,
                    format_args!(
                        "Failed to resolve destination {}: {error}",
                        self.shared.destination
                    ),
                );
                return;
            }
        };
        debug!(%destination, "destination resolved");

        let listen_address =
            SocketAddr::new(self.shared.options.listen_address, self.shared.listen_port);
        let listener = match self.bind(listen_address) {
            Ok(listener) => listener,
            Err(error) => {
                logger.critical(
                    COMPONENT,
                    format_args!("Failed to start listener on {listen_address}: {error}"),
                );
                return;
            }
        };
        self.shared.set_local_addr(listener.local_addr().ok());

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let task = spawn(
            "accept_loop",
            accept_loop(
                self.shared.clone(),
                incoming(listener),
                destination,
                cancel.clone(),
                finished.clone().drop_guard(),
            )
            .instrument(trace_span!("accept_loop", %listen_address, %destination)),
        );

        *lifecycle = Some(AcceptLoop {
            cancel,
            finished,
            task: Some(task),
        });

        // The accept loop reports `Running` itself once it begins
        let mut status = self.subscribe();
        let _ = status
            .wait_for(|status| *status != ControllerStatus::Starting)
            .await;
    }

    /// Block until the accept loop ends, through `stop` or an accept error.
    /// Returns immediately if the loop was never spawned.
    pub async fn wait(&self) {
        self.shared.logger.verbose(COMPONENT, "Waiting");

        let finished = match &*self.lifecycle.lock().await {
            Some(accept_loop) => accept_loop.finished.clone(),
            None => return,
        };

        finished.cancelled().await
    }

    /// Stop accepting and close every live session. Calling it again, or on
    /// a controller whose accept loop was never spawned, does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let logger = &self.shared.logger;

        let accept_loop = match lifecycle.as_mut() {
            Some(accept_loop) if self.status() != ControllerStatus::Stopped => accept_loop,
            _ => {
                logger.verbose(
                    COMPONENT,
                    format_args!("Stop ignored, controller is {:?}", self.status()),
                );
                return;
            }
        };

        logger.information(COMPONENT, "Stopping");
        self.shared.status.send_replace(ControllerStatus::Stopping);

        accept_loop.cancel.cancel();
        if let Some(task) = accept_loop.task.take() {
            if let Err(error) = task.await {
                logger.error(COMPONENT, format_args!("Accept loop failed: {error}"));
            }
        }
        self.shared.set_local_addr(None);

        let sessions = self.open_connections();
        for session in &sessions {
            session.close();
        }
        for session in &sessions {
            session.closed().await;
        }

        self.shared.status.send_replace(ControllerStatus::Stopped);
        logger.information(COMPONENT, "Stopped");
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        let addresses = timeout(
            self.shared.options.resolve_timeout(),
            lookup_host(self.shared.destination.addr()),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out resolving"))??;

        addresses
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
    }

    fn bind(&self, address: SocketAddr) -> io::Result<TcpListener> {
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        #[cfg(unix)]
        socket.set_reuseaddr(true)?;

        socket.bind(address)?;
        socket.listen(self.shared.options.backlog)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(accept_loop) = self.lifecycle.get_mut() {
            accept_loop.cancel.cancel();
        }

        for session in self.open_connections() {
            session.close();
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    mut incoming: impl Incoming,
    destination: SocketAddr,
    cancel: CancellationToken,
    _finished: DropGuard,
) {
    let logger = &shared.logger;

    logger.verbose(COMPONENT, "Running");
    shared.status.send_replace(ControllerStatus::Running);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = incoming.accept() => accepted,
        };

        let (client, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(_) if cancel.is_cancelled() => break,
            Err(error) => {
                logger.error(COMPONENT, format_args!("Failed during accept: {error}"));
                shared.set_local_addr(None);
                shared.status.send_replace(ControllerStatus::Error);
                return;
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        #[cfg(feature = "metrics")]
        shared.metrics.connections_accepted.inc();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            opened = RelaySession::open(
                client,
                destination,
                &shared.options,
                logger.clone(),
                #[cfg(feature = "metrics")]
                shared.metrics.clone(),
            ) => opened,
        };

        match opened {
            Ok(session) => shared.track(session),
            Err(error) => {
                #[cfg(feature = "metrics")]
                shared.metrics.upstream_connect_failures.inc();

                logger.error(
                    COMPONENT,
                    format_args!("Failed to open relay from {peer} to {destination}: {error}"),
                );
            }
        }
    }

    logger.verbose(COMPONENT, "Cancellation requested");
}

#[cfg(test)]
mod test {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use sockrelay_model::{Destination, Severity};
    use tokio::{
        io::{self, AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::{sleep, timeout},
    };
    use tokio_util::sync::CancellationToken;

    use super::{Controller, ControllerStatus, Incoming};
    use crate::{
        config::schema::RelayOptions,
        log::test::RecordingSink,
        session::{
            test::{client_pair, echo_server, open, WAIT},
            RelaySession, SessionState,
        },
    };

    /// Hands out real clients until `fail` is cancelled, then fails to accept.
    struct FailingListener {
        listener: TcpListener,
        fail: CancellationToken,
    }

    impl Incoming for FailingListener {
        fn accept(
            &mut self,
        ) -> impl std::future::Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send
        {
            async move {
                tokio::select! {
                    _ = self.fail.cancelled() => Err(io::Error::from_raw_os_error(24)),
                    accepted = self.listener.accept() => accepted,
                }
            }
        }
    }

    async fn assert_echoes(address: SocketAddr) {
        let mut client = TcpStream::connect(address).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut echoed = [0u8; 4];
        timeout(WAIT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");
    }

    fn controller(destination: SocketAddr, sink: &Arc<RecordingSink>) -> Controller {
        controller_for(
            0,
            Destination::new(destination.ip().to_string(), destination.port()),
            sink,
        )
    }

    fn controller_for(port: u16, destination: Destination, sink: &Arc<RecordingSink>) -> Controller {
        let logger = crate::log::Logger::new(sink.clone(), Severity::Verbose);
        let options = RelayOptions {
            resolve_timeout: 2,
            connect_timeout: 2,
            ..RelayOptions::default()
        };

        Controller::with_options(port, destination, options, logger)
    }

    async fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Poll until the live set has `count` sessions.
    async fn sessions(controller: &Controller, count: usize) -> Vec<Arc<RelaySession>> {
        timeout(WAIT, async {
            loop {
                let sessions = controller.open_connections();
                if sessions.len() == count {
                    return sessions;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    /// A destination that accepts and then never says anything.
    async fn silent_server() -> (SocketAddr, tokio::task::JoinHandle<Vec<TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(Ok((stream, _))) = timeout(WAIT, listener.accept()).await {
                held.push(stream);
            }
            held
        });

        (address, held)
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);

        controller.start().await;
        assert_eq!(controller.status(), ControllerStatus::Running);
        let address = controller.local_addr().unwrap();

        let mut client = TcpStream::connect(address).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        timeout(WAIT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"hello");

        let session = sessions(&controller, 1).await.remove(0);
        let notifications = Arc::new(AtomicUsize::new(0));
        session.on_disconnect({
            let notifications = notifications.clone();
            move |_| {
                notifications.fetch_add(1, Ordering::SeqCst);
            }
        });

        drop(client);
        timeout(WAIT, session.closed()).await.unwrap();

        assert_eq!(session.bytes_out(), 5);
        assert_eq!(session.bytes_in(), 5);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.count_matching(|record| record.message.ends_with("closed gracefully")),
            1
        );
        assert!(controller.open_connections().is_empty());

        controller.stop().await;
        assert_eq!(controller.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn clean_shutdown_follows_the_status_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);
        let mut status = controller.subscribe();
        assert_eq!(*status.borrow_and_update(), ControllerStatus::NotStarted);

        controller.start().await;
        assert_eq!(*status.borrow_and_update(), ControllerStatus::Running);
        controller.stop().await;
        assert_eq!(*status.borrow_and_update(), ControllerStatus::Stopped);

        assert_eq!(
            sink.messages("Controller"),
            [
                "Initialised",
                "Starting",
                "Running",
                "Stopping",
                "Cancellation requested",
                "Stopped"
            ]
        );
    }

    #[tokio::test]
    async fn unresolvable_destination_never_runs() {
        let sink = Arc::new(RecordingSink::default());
        let port = free_port().await;
        let controller = controller_for(port, Destination::new("relay-test.invalid", 80), &sink);

        controller.start().await;

        assert_eq!(controller.status(), ControllerStatus::Starting);
        assert_eq!(controller.local_addr(), None);
        assert_eq!(
            sink.count_matching(|record| record.severity == Severity::Critical),
            1
        );

        // Nothing was left bound to the port
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        timeout(WAIT, controller.wait()).await.unwrap();
        controller.stop().await;
        assert_eq!(controller.status(), ControllerStatus::Starting);
    }

    #[tokio::test]
    async fn occupied_port_is_a_critical_start_failure() {
        let sink = Arc::new(RecordingSink::default());
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let controller = controller_for(port, Destination::new("127.0.0.1", 1), &sink);

        controller.start().await;

        assert_ne!(controller.status(), ControllerStatus::Running);
        assert!(sink
            .messages("Controller")
            .iter()
            .any(|message| message.starts_with("Failed to start listener")));
    }

    #[tokio::test]
    async fn stop_closes_live_sessions() {
        let sink = Arc::new(RecordingSink::default());
        let (destination, held) = silent_server().await;
        let controller = controller(destination, &sink);
        controller.start().await;
        let address = controller.local_addr().unwrap();

        let mut first = TcpStream::connect(address).await.unwrap();
        let mut second = TcpStream::connect(address).await.unwrap();
        let live = sessions(&controller, 2).await;

        controller.stop().await;

        assert_eq!(controller.status(), ControllerStatus::Stopped);
        assert!(controller.open_connections().is_empty());
        for session in &live {
            assert_eq!(session.state(), SessionState::Closed);
        }
        assert_eq!(
            sink.count_matching(|record| record.message.ends_with("closed: relay closed locally")),
            2
        );

        let mut buffer = [0u8; 1];
        for client in [&mut first, &mut second] {
            let read = timeout(WAIT, client.read(&mut buffer)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // The listener is gone with the accept loop
        assert!(TcpStream::connect(address).await.is_err());
        drop(held);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);

        controller.stop().await;
        assert_eq!(controller.status(), ControllerStatus::NotStarted);

        controller.start().await;
        controller.stop().await;
        controller.stop().await;

        assert_eq!(controller.status(), ControllerStatus::Stopped);
        assert_eq!(
            sink.messages("Controller")
                .iter()
                .filter(|message| *message == "Stopping")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn wait_returns_once_the_accept_loop_ends() {
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(controller(echo_server().await, &sink));
        controller.start().await;

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait().await }
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        controller.stop().await;
        timeout(WAIT, waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_destination_only_drops_that_client() {
        let sink = Arc::new(RecordingSink::default());
        let destination = SocketAddr::from(([127, 0, 0, 1], free_port().await));
        let controller = controller(destination, &sink);
        controller.start().await;

        let mut client = TcpStream::connect(controller.local_addr().unwrap())
            .await
            .unwrap();
        let mut buffer = [0u8; 1];
        let read = timeout(WAIT, client.read(&mut buffer)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(controller.status(), ControllerStatus::Running);
        assert!(controller.open_connections().is_empty());
        assert!(sink
            .messages("Controller")
            .iter()
            .any(|message| message.starts_with("Failed to open relay")));

        controller.stop().await;
    }

    #[tokio::test]
    async fn snapshots_describe_live_sessions() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);
        controller.start().await;

        let mut client = TcpStream::connect(controller.local_addr().unwrap())
            .await
            .unwrap();
        client.write_all(b"abc").await.unwrap();
        let mut echoed = [0u8; 3];
        timeout(WAIT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();

        let session = sessions(&controller, 1).await.remove(0);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.id, session.id());
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.bytes_out, 3);
        assert!(snapshot
            .connection
            .starts_with(&client.local_addr().unwrap().to_string()));

        controller.stop().await;
        assert_eq!(session.snapshot().state, SessionState::Closed);
    }

    #[tokio::test]
    async fn accept_failure_ends_the_loop_in_error() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);
        let fail = CancellationToken::new();

        controller
            .start_with(|listener| FailingListener {
                listener,
                fail: fail.clone(),
            })
            .await;
        assert_eq!(controller.status(), ControllerStatus::Running);
        assert_echoes(controller.local_addr().unwrap()).await;

        fail.cancel();
        timeout(WAIT, controller.wait()).await.unwrap();

        assert_eq!(controller.status(), ControllerStatus::Error);
        assert_eq!(controller.local_addr(), None);
        let messages = sink.messages("Controller");
        assert_eq!(messages[..3], ["Initialised", "Starting", "Running"]);
        assert!(messages[3].starts_with("Failed during accept: "));
        assert_eq!(
            sink.count_matching(|record| {
                record.severity == Severity::Error
                    && record.message.starts_with("Failed during accept")
            }),
            1
        );

        timeout(WAIT, controller.stop()).await.unwrap();
        assert_eq!(controller.status(), ControllerStatus::Stopped);
        assert!(controller.open_connections().is_empty());
        assert_eq!(sink.messages("Controller").last().unwrap(), "Stopped");
    }

    #[tokio::test]
    async fn failed_accept_loop_can_be_started_again() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);
        let fail = CancellationToken::new();

        controller
            .start_with(|listener| FailingListener {
                listener,
                fail: fail.clone(),
            })
            .await;
        fail.cancel();
        timeout(WAIT, controller.wait()).await.unwrap();
        assert_eq!(controller.status(), ControllerStatus::Error);

        controller.start().await;

        assert_eq!(controller.status(), ControllerStatus::Running);
        assert_eq!(
            sink.count_matching(|record| record.severity == Severity::Warning),
            0
        );
        assert_echoes(controller.local_addr().unwrap()).await;

        controller.stop().await;
        assert_eq!(controller.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn running_controller_ignores_a_second_start() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(echo_server().await, &sink);

        controller.start().await;
        let address = controller.local_addr();
        controller.start().await;

        assert_eq!(controller.status(), ControllerStatus::Running);
        assert_eq!(controller.local_addr(), address);
        assert_eq!(
            sink.count_matching(|record| record.severity == Severity::Warning),
            1
        );

        controller.stop().await;
    }

    #[tokio::test]
    async fn sessions_that_already_ended_are_never_listed() {
        let sink = Arc::new(RecordingSink::default());
        let destination = echo_server().await;
        let controller = controller(destination, &sink);

        let (client, accepted) = client_pair().await;
        let ended = open(accepted, destination, &sink).await;
        drop(client);
        timeout(WAIT, ended.closed()).await.unwrap();

        controller.shared.track(ended);
        assert!(controller.open_connections().is_empty());

        let (client, accepted) = client_pair().await;
        let live = open(accepted, destination, &sink).await;
        controller.shared.track(live.clone());
        assert_eq!(controller.open_connections().len(), 1);

        drop(client);
        timeout(WAIT, live.closed()).await.unwrap();
        assert!(controller.open_connections().is_empty());
    }
}
