use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use mcmeta_proto::{Flag, Response, Verb};

use crate::{Deadline, Error};

pub(crate) type CommandResult = Result<Response, Error>;

/// One meta command: a verb, a key, an optional payload, and the flags to
/// send with it. Consumed by a single execution; the response arrives
/// through a one-shot channel, so the result slot is filled at most once.
pub struct Command {
    pub(crate) verb: Verb,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Bytes>,
    pub(crate) flags: Vec<Flag>,
    tx: Option<Sender<CommandResult>>,
    rx: Receiver<CommandResult>,
}

impl Command {
    fn new(verb: Verb, key: impl Into<Vec<u8>>, value: Option<Bytes>) -> Self {
        let (tx, rx) = bounded(1);
        Self { verb, key: key.into(), value, flags: Vec::new(), tx: Some(tx), rx }
    }

    /// `mg <key> v`
    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Verb::Get, key, None).with_flag(Flag::return_value())
    }

    /// `ms <key> <len>`
    pub fn set(key: impl Into<Vec<u8>>, value: Bytes) -> Self {
        Self::new(Verb::Set, key, Some(value))
    }

    /// `ms <key> <len> ME`: store only when the key does not exist.
    pub fn add(key: impl Into<Vec<u8>>, value: Bytes) -> Self {
        Self::set(key, value).with_flag(Flag::mode(b'E'))
    }

    /// `ms <key> <len> MR`: store only when the key exists.
    pub fn replace(key: impl Into<Vec<u8>>, value: Bytes) -> Self {
        Self::set(key, value).with_flag(Flag::mode(b'R'))
    }

    /// `ms <key> <len> MA`
    pub fn append(key: impl Into<Vec<u8>>, value: Bytes) -> Self {
        Self::set(key, value).with_flag(Flag::mode(b'A'))
    }

    /// `ms <key> <len> MP`
    pub fn prepend(key: impl Into<Vec<u8>>, value: Bytes) -> Self {
        Self::set(key, value).with_flag(Flag::mode(b'P'))
    }

    /// `md <key>`
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Verb::Delete, key, None)
    }

    /// `ma <key> v D<delta>`: increment is the arithmetic default mode.
    pub fn increment(key: impl Into<Vec<u8>>, delta: u64) -> Self {
        Self::new(Verb::Arithmetic, key, None)
            .with_flag(Flag::return_value())
            .with_flag(Flag::delta(delta))
    }

    /// `ma <key> v MD D<delta>`
    pub fn decrement(key: impl Into<Vec<u8>>, delta: u64) -> Self {
        Self::new(Verb::Arithmetic, key, None)
            .with_flag(Flag::return_value())
            .with_flag(Flag::mode(b'D'))
            .with_flag(Flag::delta(delta))
    }

    /// `me <key>`: item metadata dump.
    pub fn debug(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Verb::Debug, key, None)
    }

    /// `mn`
    pub fn noop() -> Self {
        Self::new(Verb::NoOp, Vec::new(), None)
    }

    /// Appends an arbitrary flag. This is the escape hatch for flags the
    /// high-level API does not surface (`h`, `l`, `q`, ...).
    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Moves the completion sender out for registration; fails on reuse.
    pub(crate) fn take_sender(&mut self) -> Result<Sender<CommandResult>, Error> {
        self.tx.take().ok_or(Error::SpentCommand)
    }

    /// Blocks until the reader loop delivers this command's response, the
    /// deadline fires, or the connection closes underneath it.
    pub fn wait(&self, deadline: Deadline) -> CommandResult {
        let received = match deadline.instant() {
            Some(at) => self.rx.recv_deadline(at).map_err(|err| match err {
                crossbeam_channel::RecvTimeoutError::Timeout => Error::Timeout,
                crossbeam_channel::RecvTimeoutError::Disconnected => Error::ConnectionClosed,
            }),
            None => self.rx.recv().map_err(|_| Error::ConnectionClosed),
        };
        received?
    }
}
