//! In-memory dialer and connection for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_transport_traits::{
    BoxFuture, Connection, ConnectionState, DialOptions, Dialer, StateWatch, TransportError,
    TransportResult,
};

/// What the next dial does.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Connection is `Ready` as soon as the dial returns.
    Ready,
    /// Connection starts `Idle` and becomes `Ready` once asked to connect.
    Lazy,
    /// Connection stays `Connecting` forever.
    Stuck,
    /// The dial fails.
    Fail(TransportError),
}

#[derive(Debug)]
struct DialerState {
    dials: AtomicUsize,
    behavior: Mutex<Behavior>,
    delay: Mutex<Duration>,
    dialed: Mutex<Vec<MockConnection>>,
}

#[derive(Debug, Clone)]
pub(crate) struct MockDialer {
    state: Arc<DialerState>,
}

impl MockDialer {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            state: Arc::new(DialerState {
                dials: AtomicUsize::new(0),
                behavior: Mutex::new(behavior),
                delay: Mutex::new(Duration::ZERO),
                dialed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn ready() -> Self {
        Self::new(Behavior::Ready)
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = delay;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock() = behavior;
    }

    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Handles to every connection dialed so far, oldest first.
    pub(crate) fn dialed(&self) -> Vec<MockConnection> {
        self.state.dialed.lock().clone()
    }
}

impl Dialer for MockDialer {
    type Connection = MockConnection;

    fn dial<'a>(
        &'a self,
        address: &'a str,
        _options: &'a DialOptions,
    ) -> BoxFuture<'a, TransportResult<MockConnection>> {
        Box::pin(async move {
            self.state.dials.fetch_add(1, Ordering::SeqCst);
            let delay = *self.state.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let behavior = self.state.behavior.lock().clone();
            let initial = match behavior {
                Behavior::Ready => ConnectionState::Ready,
                Behavior::Lazy => ConnectionState::Idle,
                Behavior::Stuck => ConnectionState::Connecting,
                Behavior::Fail(err) => return Err(err),
            };
            let conn = MockConnection::new(address, initial);
            self.state.dialed.lock().push(conn.clone());
            Ok(conn)
        })
    }
}

/// Clones share state, so tests can keep a handle to what the manager or pool holds.
#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    address: Arc<str>,
    state: StateWatch,
    created_at: Instant,
    closes: Arc<AtomicUsize>,
    fail_close: Arc<AtomicBool>,
}

impl MockConnection {
    pub(crate) fn new(address: &str, initial: ConnectionState) -> Self {
        Self {
            address: Arc::from(address),
            state: StateWatch::new(initial),
            created_at: Instant::now(),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_close: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `close` report an error. The connection still shuts down.
    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn wait_for_state_change(&self, from: ConnectionState) -> BoxFuture<'_, ConnectionState> {
        Box::pin(self.state.changed_from(from))
    }

    fn connect(&self) {
        if self.state.get() == ConnectionState::Idle {
            self.state.set(ConnectionState::Ready);
        }
    }

    fn close(&self) -> TransportResult<()> {
        if !self.state.set(ConnectionState::Shutdown) {
            return Err(TransportError::Closed);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost(format!(
                "{} reset during close",
                self.address
            )));
        }
        Ok(())
    }
}
