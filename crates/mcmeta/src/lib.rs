mod breaker;
mod client;
mod command;
mod config;
mod connection;
mod deadline;
mod error;
mod pool;
mod selector;
mod sync;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, Counts, StateChangeHook, TripPolicy};
pub use client::{Client, Item, ServerStats};
pub use command::Command;
pub use config::{BreakerFactory, Config, Dialer};
pub use connection::Connection;
pub use deadline::Deadline;
pub use error::{Disposition, Error};
pub use mcmeta_proto as proto;
pub use pool::{Pool, PoolStats};
pub use selector::{Crc32Selector, JumpHashSelector, Selector, Servers, StaticServers};
