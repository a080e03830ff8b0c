use std::{io, net::TcpStream, sync::Arc, time::Duration};

use crate::{
    Error, JumpHashSelector, Selector,
    breaker::{BreakerConfig, CircuitBreaker},
};

/// Socket factory override: `(address, connect timeout)` to an established
/// stream. The default dials plain TCP.
pub type Dialer = Arc<dyn Fn(&str, Option<Duration>) -> io::Result<TcpStream> + Send + Sync>;

/// Per-server breaker factory override; wins over [`Config::breaker`].
pub type BreakerFactory = Arc<dyn Fn(&str) -> CircuitBreaker + Send + Sync>;

/// Client configuration. `max_pool_size` is the one required field;
/// everything else has serviceable defaults.
#[derive(Clone)]
pub struct Config {
    /// Upper bound on connections per server. Must be > 0.
    pub max_pool_size: usize,
    /// Per-operation deadline when the caller supplies none.
    pub timeout: Option<Duration>,
    /// Socket establishment deadline; falls back to `timeout`.
    pub connect_timeout: Option<Duration>,
    /// Idle connections older than this are destroyed by the sweep.
    pub max_conn_lifetime: Option<Duration>,
    /// Idle connections unused for this long are destroyed by the sweep.
    pub max_conn_idle_time: Option<Duration>,
    /// Cadence of the idle-connection health sweep; `None` disables it.
    pub health_check_interval: Option<Duration>,
    pub selector: Arc<dyn Selector>,
    pub breaker: BreakerConfig,
    pub breaker_factory: Option<BreakerFactory>,
    pub dialer: Option<Dialer>,
}

impl Config {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            max_pool_size,
            timeout: Some(Duration::from_secs(1)),
            connect_timeout: None,
            max_conn_lifetime: None,
            max_conn_idle_time: None,
            health_check_interval: Some(Duration::from_secs(30)),
            selector: Arc::new(JumpHashSelector),
            breaker: BreakerConfig::default(),
            breaker_factory: None,
            dialer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_conn_lifetime = Some(lifetime);
        self
    }

    pub fn with_max_conn_idle_time(mut self, idle: Duration) -> Self {
        self.max_conn_idle_time = Some(idle);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_selector(mut self, selector: impl Selector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_breaker_factory(mut self, factory: BreakerFactory) -> Self {
        self.breaker_factory = Some(factory);
        self
    }

    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Effective connect deadline: `connect_timeout`, else `timeout`.
    pub(crate) fn effective_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.or(self.timeout)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_pool_size == 0 {
            return Err(Error::Config("max_pool_size must be greater than zero".into()));
        }
        Ok(())
    }
}
