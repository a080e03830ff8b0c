use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use mcmeta_proto::{Flag, ProtoError, Response, Status};
use tracing::{debug, warn};

use crate::{
    BreakerState, CircuitBreaker, Command, Config, Connection, Counts, Deadline, Disposition,
    Error, Pool, PoolStats, Servers,
    pool::Connector,
    sync::{lock, read, write},
};

/// A cache entry as the high-level API sees it. A miss comes back as
/// `found == false` rather than an error, so callers can treat absence as
/// data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Bytes,
    /// Opaque client flags stored alongside the value (`F`).
    pub flags: u32,
    pub cas: Option<u64>,
    pub found: bool,
}

impl Item {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { key: key.into(), value: value.into(), flags: 0, cas: None, found: true }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }

    fn missing(key: &[u8]) -> Self {
        Self { key: Bytes::copy_from_slice(key), ..Self::default() }
    }

    fn from_get(key: &[u8], resp: &Response) -> Result<Self, Error> {
        match resp.status {
            Status::Value | Status::Success => Ok(Self {
                key: Bytes::copy_from_slice(key),
                value: resp.value.clone().unwrap_or_default(),
                flags: resp.client_flags().unwrap_or(0),
                cas: resp.cas(),
                found: true,
            }),
            Status::Miss => Ok(Self::missing(key)),
            other => Err(unexpected_status(other)),
        }
    }
}

/// Per-server observability snapshot.
#[derive(Clone, Debug)]
pub struct ServerStats {
    pub addr: String,
    pub pool: PoolStats,
    pub breaker_state: BreakerState,
    pub breaker_counts: Counts,
}

struct ServerEntry {
    pool: Pool,
    breaker: CircuitBreaker,
}

struct Shared {
    config: Config,
    servers: Arc<dyn Servers>,
    entries: RwLock<HashMap<String, Arc<ServerEntry>>>,
    closed: AtomicBool,
}

/// The multi-server client: routes each key to a server with the
/// configured selector, lazily builds one pool and one circuit breaker per
/// address, and runs every call through both.
///
/// All methods take `&self`; share one client across threads (behind an
/// `Arc` if needed) rather than constructing several.
pub struct Client {
    shared: Arc<Shared>,
    sweeper_stop: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Client {
    pub fn new(servers: impl Servers + 'static, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            servers: Arc::new(servers),
            entries: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let (sweeper_stop, sweeper) = match shared.config.health_check_interval {
            Some(interval) => {
                let (stop_tx, stop_rx) = bounded(0);
                let for_sweeper = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("mcmeta-sweep".into())
                    .spawn(move || sweeper_loop(&for_sweeper, &stop_rx, interval))?;
                (Some(stop_tx), Some(handle))
            }
            None => (None, None),
        };

        Ok(Self {
            shared,
            sweeper_stop: Mutex::new(sweeper_stop),
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Fetches one key. A miss is `Ok` with `found == false`.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Item, Error> {
        let key = key.as_ref();
        let resp = self.run(Command::get(key))?;
        Item::from_get(key, &resp)
    }

    /// Stores unconditionally (or guarded by `item.cas` when set).
    pub fn set(&self, item: &Item, ttl: Option<Duration>) -> Result<(), Error> {
        let resp = self.run(storage_command(Command::set(item.key.to_vec(), item.value.clone()), item, ttl))?;
        match resp.status {
            Status::Success => Ok(()),
            Status::NotStored => Err(Error::NotStored),
            Status::Exists => Err(Error::CasMismatch),
            Status::NotFound => Err(Error::CacheMiss),
            other => Err(unexpected_status(other)),
        }
    }

    /// Stores only if the key does not already exist.
    pub fn add(&self, item: &Item, ttl: Option<Duration>) -> Result<(), Error> {
        let resp = self.run(storage_command(Command::add(item.key.to_vec(), item.value.clone()), item, ttl))?;
        match resp.status {
            Status::Success => Ok(()),
            Status::NotStored => Err(Error::KeyExists),
            Status::Exists => Err(Error::KeyExists),
            other => Err(unexpected_status(other)),
        }
    }

    /// Deletes a key; deleting an absent key is not an error.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        let resp = self.run(Command::delete(key.as_ref()))?;
        match resp.status {
            Status::Success | Status::NotFound => Ok(()),
            other => Err(unexpected_status(other)),
        }
    }

    /// Adds `delta` to a counter, creating it at `delta` when absent. A
    /// negative delta is rewritten as a decrement of its magnitude.
    /// Returns the post-operation value.
    pub fn increment(
        &self,
        key: impl AsRef<[u8]>,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, Error> {
        if delta < 0 {
            return self.decrement(key, delta.unsigned_abs(), ttl);
        }
        let cmd = vivifying(Command::increment(key.as_ref(), delta as u64), delta as u64, ttl);
        self.arithmetic(cmd)
    }

    /// Subtracts `delta` from a counter; the server clamps at zero.
    pub fn decrement(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        ttl: Option<Duration>,
    ) -> Result<i64, Error> {
        let cmd = vivifying(Command::decrement(key.as_ref(), delta), 0, ttl);
        self.arithmetic(cmd)
    }

    fn arithmetic(&self, cmd: Command) -> Result<i64, Error> {
        let resp = self.run(cmd)?;
        match resp.status {
            Status::Value => {
                let body = resp.value.as_deref().unwrap_or_default();
                std::str::from_utf8(body)
                    .ok()
                    .and_then(|s| s.trim_end().parse().ok())
                    .ok_or_else(|| {
                        Error::Protocol(ProtoError::UnexpectedToken(
                            String::from_utf8_lossy(body).into_owned(),
                        ))
                    })
            }
            Status::NotFound | Status::Miss => Err(Error::CacheMiss),
            Status::NotStored => Err(Error::NotStored),
            other => Err(unexpected_status(other)),
        }
    }

    /// Item metadata (`me`) as parsed `name=value` pairs.
    pub fn debug(&self, key: impl AsRef<[u8]>) -> Result<HashMap<String, String>, Error> {
        let resp = self.run(Command::debug(key.as_ref()))?;
        match resp.status {
            Status::Debug => {
                let message = resp.message.as_deref().unwrap_or_default();
                Ok(message
                    .split(' ')
                    .skip(1) // leading token is the key
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect())
            }
            Status::Miss | Status::NotFound => Err(Error::CacheMiss),
            other => Err(unexpected_status(other)),
        }
    }

    /// NoOp against every known server; the first failure wins.
    pub fn ping(&self) -> Result<(), Error> {
        let addrs = self.addresses()?;
        for addr in addrs {
            let entry = self.entry(&addr);
            self.run_batch(&entry, &mut [Command::noop()], Deadline::NONE)?;
        }
        Ok(())
    }

    /// Fetches many keys, fanning one pipelined batch out per server and
    /// reassembling results in input order.
    pub fn multi_get(&self, keys: &[impl AsRef<[u8]> + Sync]) -> Result<Vec<Item>, Error> {
        let mut items: Vec<Option<Item>> = Vec::new();
        items.resize_with(keys.len(), || None);

        self.fan_out(
            keys.len(),
            |i| keys[i].as_ref(),
            |i| Command::get(keys[i].as_ref()).with_flag(Flag::echo_key()),
            |i, resp| {
                items[i] = Some(Item::from_get(keys[i].as_ref(), &resp)?);
                Ok(())
            },
        )?;
        Ok(items.into_iter().flatten().collect())
    }

    /// Stores many items, one pipelined batch per server.
    pub fn multi_set(&self, items: &[Item], ttl: Option<Duration>) -> Result<(), Error> {
        self.fan_out(
            items.len(),
            |i| items[i].key.as_ref(),
            |i| {
                let item = &items[i];
                storage_command(Command::set(item.key.to_vec(), item.value.clone()), item, ttl)
            },
            |_, resp| match resp.status {
                Status::Success => Ok(()),
                Status::NotStored => Err(Error::NotStored),
                Status::Exists => Err(Error::CasMismatch),
                Status::NotFound => Err(Error::CacheMiss),
                other => Err(unexpected_status(other)),
            },
        )
    }

    /// Deletes many keys, one pipelined batch per server.
    pub fn multi_delete(&self, keys: &[impl AsRef<[u8]> + Sync]) -> Result<(), Error> {
        self.fan_out(
            keys.len(),
            |i| keys[i].as_ref(),
            |i| Command::delete(keys[i].as_ref()),
            |_, resp| match resp.status {
                Status::Success | Status::NotFound => Ok(()),
                other => Err(unexpected_status(other)),
            },
        )
    }

    /// Routes one raw command by its key. This is the way to use flags the
    /// high-level API does not surface.
    pub fn run(&self, cmd: Command) -> Result<Response, Error> {
        self.run_with_deadline(cmd, Deadline::NONE)
    }

    /// Like [`run`](Client::run) with an absolute cutoff for the whole
    /// call, observed at pool acquire, at the flush, and at every response
    /// wait. The configured timeout still applies per stage underneath it.
    pub fn run_with_deadline(&self, cmd: Command, deadline: Deadline) -> Result<Response, Error> {
        let entry = self.route(cmd.key())?;
        let mut cmds = [cmd];
        let mut responses = self.run_batch(&entry, &mut cmds, deadline)?;
        responses.pop().ok_or(Error::ConnectionClosed)
    }

    /// Snapshot of every server touched so far, sorted by address.
    pub fn stats(&self) -> Vec<ServerStats> {
        let entries = read(&self.shared.entries);
        let mut stats: Vec<ServerStats> = entries
            .iter()
            .map(|(addr, entry)| ServerStats {
                addr: addr.clone(),
                pool: entry.pool.stats(),
                breaker_state: entry.breaker.state(),
                breaker_counts: entry.breaker.counts(),
            })
            .collect();
        stats.sort_by(|a, b| a.addr.cmp(&b.addr));
        stats
    }

    /// Stops the sweeper and closes every pool. Idempotent; in-flight
    /// holders find their pool closed on release.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(lock(&self.sweeper_stop).take());
        if let Some(handle) = lock(&self.sweeper).take() {
            let _ = handle.join();
        }
        for entry in read(&self.shared.entries).values() {
            entry.pool.close();
        }
        debug!("client closed");
    }

    fn addresses(&self) -> Result<Vec<String>, Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let addrs = self.shared.servers.list();
        if addrs.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(addrs)
    }

    fn route(&self, key: &[u8]) -> Result<Arc<ServerEntry>, Error> {
        let addrs = self.addresses()?;
        let index = self.shared.config.selector.select(key, &addrs) % addrs.len();
        Ok(self.entry(&addrs[index]))
    }

    fn entry(&self, addr: &str) -> Arc<ServerEntry> {
        if let Some(entry) = read(&self.shared.entries).get(addr) {
            return Arc::clone(entry);
        }
        let mut entries = write(&self.shared.entries);
        Arc::clone(
            entries
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(self.shared.make_entry(addr))),
        )
    }

    /// One breaker-wrapped, pooled, pipelined exchange against one server.
    /// `caller` is the caller's overall cutoff; the configured timeout is
    /// re-applied freshly at each stage underneath it.
    fn run_batch(
        &self,
        entry: &ServerEntry,
        cmds: &mut [Command],
        caller: Deadline,
    ) -> Result<Vec<Response>, Error> {
        let timeout = self.shared.config.timeout;
        entry.breaker.execute(|| {
            let conn = entry.pool.acquire(stage_deadline(timeout, caller))?;
            let result = exchange(&conn, cmds, timeout, caller);
            match Disposition::of(result.as_ref().err()) {
                Disposition::Release => entry.pool.release(conn),
                Disposition::Discard => entry.pool.destroy(conn),
            }
            result
        })
    }

    /// Groups `count` inputs by their routed server, runs one batch per
    /// server on its own thread, and hands each response back to `absorb`
    /// with its input index.
    fn fan_out<'a>(
        &self,
        count: usize,
        key_of: impl Fn(usize) -> &'a [u8],
        command_of: impl Fn(usize) -> Command + Sync,
        mut absorb: impl FnMut(usize, Response) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let addrs = self.addresses()?;
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..count {
            let server = self.shared.config.selector.select(key_of(i), &addrs) % addrs.len();
            groups.entry(server).or_default().push(i);
        }

        let batches = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|(server, indices)| {
                    let entry = self.entry(&addrs[server]);
                    let command_of = &command_of;
                    scope.spawn(move || -> Result<Vec<(usize, Response)>, Error> {
                        let mut cmds: Vec<Command> =
                            indices.iter().map(|&i| command_of(i)).collect();
                        let responses = self.run_batch(&entry, &mut cmds, Deadline::NONE)?;
                        Ok(indices.into_iter().zip(responses).collect())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect::<Vec<_>>()
        });

        for batch in batches {
            for (i, resp) in batch? {
                absorb(i, resp)?;
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn make_entry(&self, addr: &str) -> ServerEntry {
        debug!(%addr, "creating pool and breaker");
        let connect_timeout = self.config.effective_connect_timeout();
        let io_timeout = self.config.timeout;
        let dialer = self.config.dialer.clone();
        let target = addr.to_string();
        let connector: Connector = Box::new(move || match &dialer {
            Some(dial) => {
                let stream = dial(&target, connect_timeout)?;
                Connection::from_stream(stream, io_timeout)
            }
            None => Connection::connect(&target, connect_timeout, io_timeout),
        });

        let breaker = match &self.config.breaker_factory {
            Some(factory) => factory(addr),
            None => CircuitBreaker::new(self.config.breaker.clone()),
        };
        ServerEntry { pool: Pool::new(connector, self.config.max_pool_size), breaker }
    }
}

fn sweeper_loop(shared: &Shared, stop: &Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let entries: Vec<Arc<ServerEntry>> =
                    read(&shared.entries).values().map(Arc::clone).collect();
                for entry in entries {
                    let destroyed = entry.pool.sweep(
                        shared.config.max_conn_lifetime,
                        shared.config.max_conn_idle_time,
                        shared.config.timeout,
                    );
                    if destroyed > 0 {
                        debug!(destroyed, "sweep destroyed idle connections");
                    }
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// The earlier of a fresh per-stage timeout window and the caller's
/// overall cutoff.
fn stage_deadline(timeout: Option<Duration>, caller: Deadline) -> Deadline {
    Deadline::from_timeout(timeout).earliest(caller)
}

fn exchange(
    conn: &Connection,
    cmds: &mut [Command],
    timeout: Option<Duration>,
    caller: Deadline,
) -> Result<Vec<Response>, Error> {
    conn.execute(cmds, stage_deadline(timeout, caller))?;
    let mut responses = Vec::with_capacity(cmds.len());
    for cmd in cmds.iter() {
        // The deadline is recomputed before every wait: each response gets
        // a full timeout window, and only the caller's cutoff bounds the
        // batch as a whole.
        responses.push(cmd.wait(stage_deadline(timeout, caller))?);
    }
    Ok(responses)
}

fn storage_command(cmd: Command, item: &Item, ttl: Option<Duration>) -> Command {
    let mut cmd = cmd;
    if item.flags != 0 {
        cmd = cmd.with_flag(Flag::set_client_flags(item.flags));
    }
    if let Some(cas) = item.cas {
        cmd = cmd.with_flag(Flag::compare_cas(cas));
    }
    if let Some(ttl) = ttl {
        cmd = cmd.with_flag(Flag::set_ttl(ttl.as_secs()));
    }
    cmd
}

fn vivifying(cmd: Command, initial: u64, ttl: Option<Duration>) -> Command {
    cmd.with_flag(Flag::initial(initial))
        .with_flag(Flag::vivify_ttl(ttl.map_or(0, |t| t.as_secs())))
}

fn unexpected_status(status: Status) -> Error {
    warn!(?status, "status does not fit the operation");
    Error::Protocol(ProtoError::UnexpectedToken(format!("{status:?}")))
}
