//! Connection pooling for a single server.
use log::{trace, warn};
use serde_derive::{Deserialize, Serialize};

use crate::apm::{ClusterEvent, Listener};
use crate::cancel::CancellationToken;
use crate::connection::{Connection, ConnectionFactory, ConnectionId};
use crate::error::Error::{self, ArgumentError, OperationError};
use crate::error::Result;
use crate::topology::server::ServerId;
use crate::wire_protocol::Message;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_MAX_WAIT_QUEUE_SIZE: usize = 500;
pub const DEFAULT_MAINTENANCE_FREQUENCY_MS: u64 = 60_000;

/// Sizing and eviction rules for a connection pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    /// Connections the background maintenance keeps open.
    pub min_size: usize,
    /// Open connections, checked out or available, never exceed this.
    pub max_size: usize,
    /// Callers allowed to block waiting for a connection at once.
    pub max_wait_queue_size: usize,
    pub connection_max_idle_time: Option<Duration>,
    pub connection_max_life_time: Option<Duration>,
    pub size_maintenance_frequency: Duration,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        ConnectionPoolSettings {
            min_size: 0,
            max_size: DEFAULT_MAX_POOL_SIZE,
            max_wait_queue_size: DEFAULT_MAX_WAIT_QUEUE_SIZE,
            connection_max_idle_time: None,
            connection_max_life_time: None,
            size_maintenance_frequency: Duration::from_millis(DEFAULT_MAINTENANCE_FREQUENCY_MS),
        }
    }
}

impl ConnectionPoolSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_size < 1 {
            return Err(ArgumentError(String::from(
                "The connection pool size must be greater than zero.",
            )));
        }
        if self.min_size > self.max_size {
            return Err(ArgumentError(format!(
                "The minimum pool size ({}) cannot exceed the maximum pool size ({}).",
                self.min_size, self.max_size
            )));
        }
        if self.size_maintenance_frequency == Duration::from_secs(0) {
            return Err(ArgumentError(String::from(
                "The size maintenance frequency must be greater than zero.",
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Open,
    Disposed,
}

struct IdleConnection {
    connection: Box<dyn Connection>,
    created: Instant,
    last_used: Instant,
    generation: u64,
}

struct PoolState {
    phase: Phase,
    // Used as a stack: the most recently returned connection goes out first.
    available: Vec<IdleConnection>,
    // Open connections plus slots reserved for connections being created.
    size: usize,
    // The pool generation. Clearing the pool increments it, and connections
    // from an older generation are closed instead of being returned.
    generation: u64,
    // Tickets of blocked callers, served in arrival order.
    wait_queue: VecDeque<u64>,
    next_ticket: u64,
}

struct PoolInner {
    server_id: ServerId,
    settings: ConnectionPoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<Listener>,
    state: Mutex<PoolState>,
    // Wakes callers waiting for a connection.
    wait_lock: Condvar,
    // Wakes the maintenance thread early on dispose.
    maintenance: Condvar,
}

/// Handles threaded connections to a single server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server_id", &self.inner.server_id)
            .field("size", &self.size())
            .finish()
    }
}

// What a caller came away with once it reached the pool.
enum Acquired {
    Idle(IdleConnection),
    Create(u64),
}

impl ConnectionPool {
    pub fn new(
        server_id: ServerId,
        settings: ConnectionPoolSettings,
        factory: Arc<dyn ConnectionFactory>,
        listener: Arc<Listener>,
    ) -> Result<ConnectionPool> {
        settings.validate()?;
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                server_id: server_id,
                state: Mutex::new(PoolState {
                    phase: Phase::Uninitialized,
                    available: Vec::with_capacity(settings.max_size),
                    size: 0,
                    generation: 0,
                    wait_queue: VecDeque::new(),
                    next_ticket: 0,
                }),
                settings: settings,
                factory: factory,
                listener: listener,
                wait_lock: Condvar::new(),
                maintenance: Condvar::new(),
            }),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.inner.server_id
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.inner.settings
    }

    /// Opens the pool and starts background size maintenance. Calling it on
    /// an open pool does nothing.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock()?;
            match state.phase {
                Phase::Open => return Ok(()),
                Phase::Disposed => return Err(Error::PoolDisposed(self.inner.server_id.endpoint.clone())),
                Phase::Uninitialized => state.phase = Phase::Open,
            }
        }

        let weak = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name(format!("pool-maintenance-{}", self.inner.server_id.endpoint))
            .spawn(move || maintenance_loop(weak))?;
        Ok(())
    }

    /// Attempts to acquire a connection. An available connection is reused
    /// when there is one; otherwise a new one is created if the pool is below
    /// its maximum size. Failing both, the caller joins the wait queue and
    /// blocks until a connection is returned, the timeout expires, or `cancel`
    /// fires.
    pub fn get_connection(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<PooledConnection> {
        let start = Instant::now();
        // A timeout too large to represent waits indefinitely.
        let deadline = timeout.and_then(|t| start.checked_add(t));
        let mut stale = Vec::new();

        let fast = {
            let mut state = self.inner.state.lock()?;
            self.inner.check_phase(&state)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if state.wait_queue.is_empty() {
                self.inner.try_acquire(&mut state, &mut stale)
            } else {
                None
            }
        };
        self.inner.close_all(stale);

        if let Some(acquired) = fast {
            return complete(&self.inner, acquired);
        }

        let acquired = self.wait_for_connection(start, deadline, cancel)?;
        complete(&self.inner, acquired)
    }

    fn wait_for_connection(
        &self,
        start: Instant,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Acquired> {
        let ticket = {
            let mut state = self.inner.state.lock()?;
            self.inner.check_phase(&state)?;
            if state.wait_queue.len() >= self.inner.settings.max_wait_queue_size {
                return Err(Error::PoolExhausted(self.inner.server_id.endpoint.clone()));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.wait_queue.push_back(ticket);
            ticket
        };

        trace!("pool {} queued waiter {}", self.inner.server_id, ticket);
        self.inner.listener.emit(&ClusterEvent::WaitQueueEntered {
            server_id: self.inner.server_id.clone(),
        });

        let waker = Arc::downgrade(&self.inner);
        let _registration = cancel.register(move || {
            if let Some(inner) = waker.upgrade() {
                let _guard = inner.state.lock();
                inner.wait_lock.notify_all();
            }
        });

        let mut stale = Vec::new();
        let mut state = self.inner.state.lock()?;
        let result = loop {
            if state.phase == Phase::Disposed {
                break Err(Error::PoolDisposed(self.inner.server_id.endpoint.clone()));
            }
            if cancel.is_cancelled() {
                break Err(Error::Cancelled);
            }

            if state.wait_queue.front() == Some(&ticket) {
                if let Some(acquired) = self.inner.try_acquire(&mut state, &mut stale) {
                    break Ok(acquired);
                }
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(Error::timeout("waiting for a pooled connection", now - start));
                    }
                    state = self.inner.wait_lock.wait_timeout(state, deadline - now)?.0;
                }
                None => state = self.inner.wait_lock.wait(state)?,
            }
        };

        state.wait_queue.retain(|&t| t != ticket);
        // The next head may be able to proceed now.
        self.inner.wait_lock.notify_all();
        drop(state);

        self.inner.close_all(stale);
        trace!("pool {} dequeued waiter {}", self.inner.server_id, ticket);
        self.inner.listener.emit(&ClusterEvent::WaitQueueExited {
            server_id: self.inner.server_id.clone(),
        });

        result
    }

    /// Closes every available connection and marks checked-out ones as
    /// stale, so they are closed when released.
    pub fn clear(&self) {
        let drained = match self.inner.state.lock() {
            Ok(mut state) => {
                state.generation += 1;
                let drained: Vec<IdleConnection> = state.available.drain(..).collect();
                state.size -= drained.len();
                self.inner.wait_lock.notify_all();
                drained
            }
            Err(_) => return,
        };

        self.inner.close_all(drained.into_iter().map(|idle| idle.connection).collect());
    }

    /// Closes the pool. Waiters fail with `PoolDisposed`, available
    /// connections are closed, and checked-out connections are closed when
    /// they are released.
    pub fn dispose(&self) {
        let drained = match self.inner.state.lock() {
            Ok(mut state) => {
                if state.phase == Phase::Disposed {
                    return;
                }
                state.phase = Phase::Disposed;
                let drained: Vec<IdleConnection> = state.available.drain(..).collect();
                state.size -= drained.len();
                self.inner.wait_lock.notify_all();
                self.inner.maintenance.notify_all();
                drained
            }
            Err(_) => return,
        };

        self.inner.close_all(drained.into_iter().map(|idle| idle.connection).collect());
    }

    /// Open connections, including those being created.
    pub fn size(&self) -> usize {
        self.inner.state.lock().map(|state| state.size).unwrap_or(0)
    }

    pub fn available_count(&self) -> usize {
        self.inner.state.lock().map(|state| state.available.len()).unwrap_or(0)
    }

    pub fn wait_queue_size(&self) -> usize {
        self.inner.state.lock().map(|state| state.wait_queue.len()).unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().map(|state| state.generation).unwrap_or(0)
    }

    /// Runs one maintenance pass now instead of waiting for the next tick.
    pub fn maintain(&self) -> Result<()> {
        self.inner.maintain()
    }
}

impl PoolInner {
    fn check_phase(&self, state: &PoolState) -> Result<()> {
        match state.phase {
            Phase::Open => Ok(()),
            Phase::Disposed => Err(Error::PoolDisposed(self.server_id.endpoint.clone())),
            Phase::Uninitialized => Err(OperationError(format!(
                "The connection pool for {} has not been initialized.",
                self.server_id
            ))),
        }
    }

    fn is_perished(&self, idle: &IdleConnection, generation: u64, now: Instant) -> bool {
        if idle.generation != generation || !idle.connection.is_open() {
            return true;
        }
        let idle_too_long = self
            .settings
            .connection_max_idle_time
            .map_or(false, |max| now.duration_since(idle.last_used) >= max);
        idle_too_long || self.lifetime_expired(idle.created, now)
    }

    fn lifetime_expired(&self, created: Instant, now: Instant) -> bool {
        self.settings
            .connection_max_life_time
            .map_or(false, |max| now.duration_since(created) >= max)
    }

    // Pops a usable available connection, or reserves a slot for a new one.
    // Perished connections are moved to `stale` to be closed off the lock.
    fn try_acquire(&self, state: &mut PoolState, stale: &mut Vec<Box<dyn Connection>>) -> Option<Acquired> {
        let now = Instant::now();
        while let Some(idle) = state.available.pop() {
            if self.is_perished(&idle, state.generation, now) {
                state.size -= 1;
                stale.push(idle.connection);
                continue;
            }
            return Some(Acquired::Idle(idle));
        }

        if state.size < self.settings.max_size {
            state.size += 1;
            return Some(Acquired::Create(state.generation));
        }

        None
    }

    // Creates a connection for a slot that has already been reserved. The
    // slot is given back if creation fails.
    fn create(&self, generation: u64) -> Result<Box<dyn Connection>> {
        match self.factory.create_connection(&self.server_id) {
            Ok(connection) => {
                self.listener.emit(&ClusterEvent::ConnectionOpened {
                    connection_id: connection.id().clone(),
                });
                trace!("pool {} created a generation {} connection", self.server_id, generation);
                Ok(connection)
            }
            Err(err) => {
                if let Ok(mut state) = self.state.lock() {
                    state.size -= 1;
                    self.wait_lock.notify_all();
                }
                Err(err)
            }
        }
    }

    // Hands out a connection created for a reserved slot, unless the pool
    // was disposed while it was being opened.
    fn admit(&self, connection: Box<dyn Connection>) -> Result<Box<dyn Connection>> {
        {
            let mut state = self.state.lock()?;
            if state.phase != Phase::Disposed {
                return Ok(connection);
            }
            state.size -= 1;
        }

        self.close_all(vec![connection]);
        Err(Error::PoolDisposed(self.server_id.endpoint.clone()))
    }

    fn check_in(&self, connection: Box<dyn Connection>, created: Instant, generation: u64, healthy: bool) {
        self.listener.emit(&ClusterEvent::ConnectionCheckedIn {
            connection_id: connection.id().clone(),
        });

        let closing = match self.state.lock() {
            Ok(mut state) => {
                let now = Instant::now();
                let reusable = healthy
                    && connection.is_open()
                    && state.phase == Phase::Open
                    && generation == state.generation
                    && !self.lifetime_expired(created, now);

                let closing = if reusable {
                    state.available.push(IdleConnection {
                        connection: connection,
                        created: created,
                        last_used: now,
                        generation: generation,
                    });
                    None
                } else {
                    state.size -= 1;
                    Some(connection)
                };

                // Notify waiting threads that the pool has been repopulated.
                self.wait_lock.notify_all();
                closing
            }
            Err(_) => Some(connection),
        };

        if let Some(connection) = closing {
            self.close_all(vec![connection]);
        }
    }

    fn close_all(&self, connections: Vec<Box<dyn Connection>>) {
        for mut connection in connections {
            connection.close();
            self.listener.emit(&ClusterEvent::ConnectionClosed {
                connection_id: connection.id().clone(),
            });
        }
    }

    fn maintain(&self) -> Result<()> {
        let stale = {
            let mut state = self.state.lock()?;
            if state.phase != Phase::Open {
                return Ok(());
            }

            let now = Instant::now();
            let generation = state.generation;
            let (perished, keep): (Vec<IdleConnection>, Vec<IdleConnection>) = state
                .available
                .drain(..)
                .partition(|idle| self.is_perished(idle, generation, now));
            state.available = keep;
            state.size -= perished.len();
            perished
        };
        self.close_all(stale.into_iter().map(|idle| idle.connection).collect());

        loop {
            let generation = {
                let mut state = self.state.lock()?;
                if state.phase != Phase::Open || state.size >= self.settings.min_size {
                    return Ok(());
                }
                state.size += 1;
                state.generation
            };

            let connection = self.create(generation)?;
            let now = Instant::now();
            let closing = {
                let mut state = self.state.lock()?;
                if state.phase == Phase::Open && state.generation == generation {
                    state.available.push(IdleConnection {
                        connection: connection,
                        created: now,
                        last_used: now,
                        generation: generation,
                    });
                    self.wait_lock.notify_all();
                    None
                } else {
                    state.size -= 1;
                    Some(connection)
                }
            };

            if let Some(connection) = closing {
                self.close_all(vec![connection]);
                return Ok(());
            }
        }
    }
}

fn complete(inner: &Arc<PoolInner>, acquired: Acquired) -> Result<PooledConnection> {
    let pooled = match acquired {
        Acquired::Idle(idle) => PooledConnection::new(inner.clone(), idle.connection, idle.created, idle.generation),
        Acquired::Create(generation) => {
            let connection = inner.admit(inner.create(generation)?)?;
            PooledConnection::new(inner.clone(), connection, Instant::now(), generation)
        }
    };

    inner.listener.emit(&ClusterEvent::ConnectionCheckedOut {
        connection_id: pooled.id.clone(),
    });
    Ok(pooled)
}

fn maintenance_loop(pool: Weak<PoolInner>) {
    loop {
        let inner = match pool.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        if let Err(err) = inner.maintain() {
            warn!("size maintenance for pool {} failed: {}", inner.server_id, err);
        }

        let state = match inner.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.phase != Phase::Open {
            return;
        }
        let frequency = inner.settings.size_maintenance_frequency;
        if inner.maintenance.wait_timeout(state, frequency).is_err() {
            return;
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool
/// it came from, or closes it if it is unhealthy or the pool has moved on.
pub struct PooledConnection {
    id: ConnectionId,
    // Always Some until the handle is dropped.
    connection: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    created: Instant,
    generation: u64,
    healthy: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, connection: Box<dyn Connection>, created: Instant, generation: u64) -> PooledConnection {
        PooledConnection {
            id: connection.id().clone(),
            connection: Some(connection),
            pool: pool,
            created: created,
            generation: generation,
            healthy: true,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// The connection will be closed instead of pooled on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    fn closed_error(&self) -> Error {
        OperationError(format!("Connection {} has been released.", self.id))
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl Connection for PooledConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.connection.as_ref().map_or(false, |connection| connection.is_open())
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        let result = match self.connection {
            Some(ref mut connection) => connection.send_message(message),
            None => return Err(self.closed_error()),
        };
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    fn receive_message(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Message> {
        let result = match self.connection {
            Some(ref mut connection) => connection.receive_message(timeout, cancel),
            None => return Err(self.closed_error()),
        };
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    fn close(&mut self) {
        self.healthy = false;
        if let Some(ref mut connection) = self.connection {
            connection.close();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.check_in(connection, self.created, self.generation, self.healthy);
        }
    }
}
