use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{Connection, Deadline, Error, sync::lock};

pub(crate) type Connector = Box<dyn Fn() -> Result<Connection, Error> + Send + Sync>;

/// Counters exposed by [`Pool::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created_total: u64,
    pub acquires: u64,
    pub acquire_waits: u64,
    pub acquire_errors: u64,
    pub mean_wait: Duration,
}

struct Inner {
    idle: Vec<Connection>,
    /// Issued + idle; never exceeds `max`.
    size: usize,
    closed: bool,
    created_total: u64,
    acquires: u64,
    acquire_waits: u64,
    acquire_errors: u64,
    total_wait: Duration,
}

/// A bounded set of connections to one server.
///
/// Acquired connections are exclusively held until released. Releasing a
/// healthy connection parks it idle and stamps its last-used time;
/// releasing into a closed pool, or releasing a dead connection, destroys
/// it instead.
pub struct Pool {
    inner: Mutex<Inner>,
    available: Condvar,
    max: usize,
    connector: Connector,
}

impl Pool {
    pub(crate) fn new(connector: Connector, max: usize) -> Self {
        debug_assert!(max > 0);
        Self {
            inner: Mutex::new(Inner {
                idle: Vec::with_capacity(max),
                size: 0,
                closed: false,
                created_total: 0,
                acquires: 0,
                acquire_waits: 0,
                acquire_errors: 0,
                total_wait: Duration::ZERO,
            }),
            available: Condvar::new(),
            max,
            connector,
        }
    }

    /// Pops an idle connection, constructs a new one while under the size
    /// bound, or blocks until a holder releases or the deadline fires.
    pub fn acquire(&self, deadline: Deadline) -> Result<Connection, Error> {
        let start = Instant::now();
        let mut waited = false;
        let mut inner = lock(&self.inner);
        inner.acquires += 1;

        loop {
            if inner.closed {
                inner.acquire_errors += 1;
                return Err(Error::PoolClosed);
            }

            // A connection can die while parked; skip the corpse.
            while let Some(conn) = inner.idle.pop() {
                if conn.is_closed() {
                    inner.size -= 1;
                    continue;
                }
                if waited {
                    inner.total_wait += start.elapsed();
                }
                return Ok(conn);
            }

            if inner.size < self.max {
                inner.size += 1;
                inner.created_total += 1;
                drop(inner);
                match (self.connector)() {
                    Ok(conn) => {
                        if waited {
                            lock(&self.inner).total_wait += start.elapsed();
                        }
                        return Ok(conn);
                    }
                    Err(err) => {
                        let mut inner = lock(&self.inner);
                        inner.size -= 1;
                        inner.created_total -= 1;
                        inner.acquire_errors += 1;
                        drop(inner);
                        self.available.notify_one();
                        return Err(err);
                    }
                }
            }

            if !waited {
                waited = true;
                inner.acquire_waits += 1;
            }
            inner = match deadline.instant() {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        inner.acquire_errors += 1;
                        return Err(Error::Timeout);
                    }
                    let (guard, timed_out) = self
                        .available
                        .wait_timeout(inner, at - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    if timed_out.timed_out() && guard.idle.is_empty() && guard.size >= self.max {
                        let mut guard = guard;
                        guard.acquire_errors += 1;
                        return Err(Error::Timeout);
                    }
                    guard
                }
                None => self.available.wait(inner).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Returns a connection to the idle set, refreshing its last-used
    /// stamp. Dead connections and returns into a closed pool destroy.
    pub fn release(&self, conn: Connection) {
        self.release_inner(conn, true);
    }

    /// Same as [`release`](Pool::release) but leaves the last-used stamp
    /// alone, so idle time keeps accruing across health probes.
    pub(crate) fn release_untouched(&self, conn: Connection) {
        self.release_inner(conn, false);
    }

    fn release_inner(&self, conn: Connection, touch: bool) {
        let mut inner = lock(&self.inner);
        if inner.closed || conn.is_closed() {
            inner.size -= 1;
            drop(inner);
            conn.close();
            self.available.notify_one();
            return;
        }
        if touch {
            conn.touch();
        }
        inner.idle.push(conn);
        drop(inner);
        self.available.notify_one();
    }

    /// Closes the connection and frees its pool slot.
    pub fn destroy(&self, conn: Connection) {
        conn.close();
        lock(&self.inner).size -= 1;
        self.available.notify_one();
    }

    /// Drains every idle connection. The drained handles still occupy pool
    /// slots; the caller must hand each one back through
    /// [`release`](Pool::release)/[`destroy`](Pool::destroy).
    pub fn acquire_all_idle(&self) -> Vec<Connection> {
        let mut inner = lock(&self.inner);
        std::mem::take(&mut inner.idle)
    }

    /// Destroys idle connections that are past their lifetime, past the
    /// idle cutoff, or failing a NoOp probe. Survivors go back without a
    /// last-used refresh. Returns how many were destroyed.
    pub fn sweep(
        &self,
        max_lifetime: Option<Duration>,
        max_idle: Option<Duration>,
        probe_timeout: Option<Duration>,
    ) -> usize {
        let mut destroyed = 0;
        for conn in self.acquire_all_idle() {
            let too_old = max_lifetime.is_some_and(|l| conn.created_at().elapsed() >= l);
            let too_idle = max_idle.is_some_and(|l| conn.last_used().elapsed() >= l);
            if too_old || too_idle {
                debug!(peer = %conn.peer(), too_old, too_idle, "sweeping connection");
                self.destroy(conn);
                destroyed += 1;
                continue;
            }
            if let Err(err) = conn.ping(Deadline::from_timeout(probe_timeout)) {
                debug!(peer = %conn.peer(), %err, "health probe failed, sweeping connection");
                self.destroy(conn);
                destroyed += 1;
                continue;
            }
            self.release_untouched(conn);
        }
        destroyed
    }

    /// Marks the pool closed and destroys the idle set. Issued connections
    /// are destroyed as they come back; subsequent acquires fail.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        let drained: Vec<_> = inner.idle.drain(..).collect();
        inner.size -= drained.len();
        drop(inner);
        for conn in drained {
            conn.close();
        }
        self.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            total: inner.size,
            idle: inner.idle.len(),
            in_use: inner.size - inner.idle.len(),
            created_total: inner.created_total,
            acquires: inner.acquires,
            acquire_waits: inner.acquire_waits,
            acquire_errors: inner.acquire_errors,
            mean_wait: if inner.acquire_waits > 0 {
                inner.total_wait / inner.acquire_waits as u32
            } else {
                Duration::ZERO
            },
        }
    }
}
