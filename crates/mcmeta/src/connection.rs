use std::{
    collections::HashMap,
    io::{BufReader, BufWriter, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use mcmeta_proto::{
    Flag, ProtoError, Response, Status, Verb, encode_request, read_response, validate_key,
};
use tracing::{debug, warn};

use crate::{
    Deadline, Error,
    command::{Command, CommandResult},
    sync::lock,
};

/// One TCP connection running the pipelined request/response engine.
///
/// Writers serialize frame emission under a single lock that also assigns
/// opaque tokens and registers commands in the pending map; a dedicated
/// reader thread is the only party reading from the socket and dispatches
/// each response to its command by the echoed opaque (falling back to the
/// echoed key, then to send order). The socket stays open until [`close`]
/// or a fatal read/write error; there is no reopen.
///
/// A connection is exclusively held by whoever acquired it from the pool,
/// but the holder may pipeline from several threads: `execute` takes
/// `&self` and interleaved batches correlate safely.
///
/// [`close`]: Connection::close
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    peer: String,
    sock: TcpStream,
    core: Mutex<Core>,
    closed: AtomicBool,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

/// Everything guarded by the write lock.
#[derive(Debug)]
struct Core {
    writer: BufWriter<TcpStream>,
    next_opaque: u64,
    pending: HashMap<u64, PendingCommand>,
}

#[derive(Debug)]
struct PendingCommand {
    verb: Verb,
    key: Vec<u8>,
    tx: Sender<CommandResult>,
}

impl Connection {
    /// Dials `addr` and starts the reader thread. `io_timeout` becomes the
    /// kernel write deadline for frame flushes; reads are unbounded because
    /// the reader thread is unblocked by socket shutdown instead.
    pub fn connect(
        addr: &str,
        connect_timeout: Option<Duration>,
        io_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let stream = dial(addr, connect_timeout)?;
        Self::from_stream(stream, io_timeout)
    }

    /// Wraps an established stream (the dialer-override path).
    pub fn from_stream(stream: TcpStream, io_timeout: Option<Duration>) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(io_timeout)?;
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let writer = BufWriter::new(stream.try_clone()?);
        let reader = BufReader::new(stream.try_clone()?);

        let shared = Arc::new(Shared {
            peer,
            sock: stream,
            core: Mutex::new(Core {
                writer,
                next_opaque: 0,
                pending: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
        });

        let for_reader = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("mcmeta-read-{}", shared.peer))
            .spawn(move || reader_loop(&for_reader, reader))?;

        debug!(peer = %shared.peer, "connection established");
        Ok(Self { shared })
    }

    /// Pipelines `cmds` onto the wire: every key is validated up front (a
    /// malformed key aborts before any byte is written), then each command
    /// gets the next opaque, is registered, and is serialized; one flush
    /// puts the whole batch on the socket contiguously. The caller awaits
    /// completion through each command's `wait`.
    pub fn execute(&self, cmds: &mut [Command], deadline: Deadline) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if deadline.expired() {
            return Err(Error::Timeout);
        }
        for cmd in cmds.iter() {
            if cmd.verb != Verb::NoOp {
                validate_key(&cmd.key)?;
            }
        }

        let mut core = lock(&self.shared.core);
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let mut frames = Vec::with_capacity(cmds.len() * 48);
        let mut registrations = Vec::with_capacity(cmds.len());
        for cmd in cmds.iter_mut() {
            let opaque = core.next_opaque;
            core.next_opaque += 1;
            let tx = cmd.take_sender()?;

            // mn takes no flags, its MN echo correlates by verb instead
            if cmd.verb == Verb::NoOp {
                encode_request(&mut frames, cmd.verb, &cmd.key, None, &cmd.flags)?;
            } else {
                let mut flags = cmd.flags.clone();
                flags.push(Flag::opaque(opaque.to_string()));
                encode_request(&mut frames, cmd.verb, &cmd.key, cmd.value.as_deref(), &flags)?;
            }
            registrations.push((opaque, PendingCommand { verb: cmd.verb, key: cmd.key.clone(), tx }));
        }
        for (opaque, pending) in registrations {
            core.pending.insert(opaque, pending);
        }

        let flushed = core.writer.write_all(&frames).and_then(|()| core.writer.flush());
        drop(core);
        if let Err(err) = flushed {
            warn!(peer = %self.shared.peer, ?err, "flush failed, closing connection");
            self.shared.close_and_fail();
            return Err(err.into());
        }
        Ok(())
    }

    /// Sends a NoOp and waits for its MN echo.
    pub fn ping(&self, deadline: Deadline) -> Result<(), Error> {
        let mut cmd = Command::noop();
        self.execute(std::slice::from_mut(&mut cmd), deadline)?;
        let resp = cmd.wait(deadline)?;
        match resp.status {
            Status::NoOp => Ok(()),
            other => Err(Error::Protocol(ProtoError::UnexpectedToken(format!("{other:?}")))),
        }
    }

    /// Idempotent. Shuts the socket down (which stops the reader thread)
    /// and fails every pending command with `ConnectionClosed`; each
    /// pending command observes exactly one such synthetic response.
    pub fn close(&self) {
        self.shared.close_and_fail();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    pub fn last_used(&self) -> Instant {
        *lock(&self.shared.last_used)
    }

    pub(crate) fn touch(&self) {
        *lock(&self.shared.last_used) = Instant::now();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn dial(addr: &str, connect_timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let Some(timeout) = connect_timeout else {
        return Ok(TcpStream::connect(addr)?);
    };
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing"))
        .into())
}

impl Shared {
    fn close_and_fail(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.sock.shutdown(Shutdown::Both);
        let mut core = lock(&self.core);
        for (_, pending) in core.pending.drain() {
            let _ = pending.tx.send(Err(Error::ConnectionClosed));
        }
    }

    /// Reader hit a fatal error: deliver framing errors to the oldest
    /// in-flight command (the one the broken frame was answering, since the
    /// server replies in send order), then fail the rest.
    fn reader_failed(&self, err: ProtoError) {
        self.closed.store(true, Ordering::Release);
        let _ = self.sock.shutdown(Shutdown::Both);
        let mut core = lock(&self.core);
        if !matches!(err, ProtoError::Io(_)) {
            if let Some(pending) = remove_oldest(&mut core.pending) {
                let _ = pending.tx.send(Err(err.into()));
            }
        }
        for (_, pending) in core.pending.drain() {
            let _ = pending.tx.send(Err(Error::ConnectionClosed));
        }
    }

    fn dispatch(&self, resp: Response) -> Flow {
        let mut core = lock(&self.core);
        match resp.status {
            Status::NoOp => {
                match remove_oldest_with(&mut core.pending, |p| p.verb == Verb::NoOp) {
                    Some(pending) => drop(pending.tx.send(Ok(resp))),
                    None => debug!(peer = %self.peer, "MN with no pending noop"),
                }
                Flow::Continue
            }
            Status::ServerError => {
                // Stays usable after SERVER_ERROR; uncorrelated lines are
                // attributed to the oldest in-flight command.
                let message = resp.message.clone().unwrap_or_default();
                match remove_correlated(&mut core.pending, &resp) {
                    Some(pending) => drop(pending.tx.send(Err(Error::Server(message)))),
                    None => debug!(peer = %self.peer, %message, "SERVER_ERROR with nothing in flight"),
                }
                Flow::Continue
            }
            Status::ClientError | Status::Error => {
                // The server closes its side after CLIENT_ERROR; the stream
                // position is unknowable, so the connection dies with it.
                // Attribution is unconditionally the oldest in-flight
                // command, whatever the line happens to echo.
                let message = resp.message.clone().unwrap_or_default();
                warn!(peer = %self.peer, %message, "protocol rejected, closing connection");
                if let Some(pending) = remove_oldest(&mut core.pending) {
                    let _ = pending.tx.send(Err(Error::Client(message)));
                }
                drop(core);
                self.close_and_fail();
                Flow::Stop
            }
            _ => {
                match remove_target(&mut core.pending, &resp) {
                    Some(pending) => drop(pending.tx.send(Ok(resp))),
                    None => warn!(peer = %self.peer, status = ?resp.status, "response with no pending command"),
                }
                Flow::Continue
            }
        }
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn reader_loop(shared: &Shared, mut reader: BufReader<TcpStream>) {
    loop {
        match read_response(&mut reader) {
            Ok(resp) => {
                if shared.dispatch(resp) == Flow::Stop {
                    return;
                }
            }
            Err(err) => {
                if !shared.closed.load(Ordering::Acquire) {
                    debug!(peer = %shared.peer, %err, "reader stopping");
                }
                shared.reader_failed(err);
                return;
            }
        }
    }
}

fn oldest_key_with(
    pending: &HashMap<u64, PendingCommand>,
    pred: impl Fn(&PendingCommand) -> bool,
) -> Option<u64> {
    pending.iter().filter(|(_, p)| pred(p)).map(|(&opaque, _)| opaque).min()
}

fn remove_oldest(pending: &mut HashMap<u64, PendingCommand>) -> Option<PendingCommand> {
    remove_oldest_with(pending, |_| true)
}

fn remove_oldest_with(
    pending: &mut HashMap<u64, PendingCommand>,
    pred: impl Fn(&PendingCommand) -> bool,
) -> Option<PendingCommand> {
    let opaque = oldest_key_with(pending, pred)?;
    pending.remove(&opaque)
}

/// By opaque echo, else by key echo, else by send order. An opaque that
/// matches nothing in flight correlates to nothing: mis-delivery is worse
/// than dropping the frame.
fn remove_target(
    pending: &mut HashMap<u64, PendingCommand>,
    resp: &Response,
) -> Option<PendingCommand> {
    if resp.opaque().is_some() {
        return remove_correlated_by_opaque(pending, resp);
    }
    if let Some(key) = resp.key() {
        return remove_oldest_with(pending, |p| p.key == key);
    }
    remove_oldest(pending)
}

/// Like `remove_target` but for SERVER_ERROR lines, the one case where a
/// correlator allows targeted delivery; without one the oldest in-flight
/// command is attributed.
fn remove_correlated(
    pending: &mut HashMap<u64, PendingCommand>,
    resp: &Response,
) -> Option<PendingCommand> {
    if resp.opaque().is_some() {
        return remove_correlated_by_opaque(pending, resp).or_else(|| remove_oldest(pending));
    }
    remove_oldest(pending)
}

fn remove_correlated_by_opaque(
    pending: &mut HashMap<u64, PendingCommand>,
    resp: &Response,
) -> Option<PendingCommand> {
    let opaque: u64 = std::str::from_utf8(resp.opaque()?).ok()?.parse().ok()?;
    pending.remove(&opaque)
}
