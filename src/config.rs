//! Dial target, credentials, and policy knobs, assembled through a
//! `Builder`: an options struct with chained setters and a `build()` that
//! fills in defaults.

use std::time::Duration;

/// `host:port` (or a bare socket path in future transports) the dialer
/// connects to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    /// Delay before the `attempt`-th (0-indexed) reconnect try.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter_span = capped * self.jitter;
        let jittered = capped + (rand::random::<f64>() * 2.0 - 1.0) * jitter_span;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Immutable, cloneable connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub default_deadline: Option<Duration>,
    pub backoff: Backoff,
    pub max_reconnect_attempts: Option<u32>,
    pub writer_queue_capacity: usize,
    pub required_features: Vec<u32>,
    pub idempotent_by_default: bool,
    #[cfg(feature = "tls")]
    pub tls: Option<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl Config {
    pub fn builder(endpoint: Endpoint) -> Builder {
        Builder::new(endpoint)
    }
}

/// Builds a [`Config`]: a plain struct of fields with chained `&mut self`
/// setters, finished off with `.build()`.
#[derive(Debug, Clone)]
pub struct Builder {
    endpoint: Endpoint,
    credentials: Option<Credentials>,
    connect_timeout: Duration,
    default_deadline: Option<Duration>,
    backoff: Backoff,
    max_reconnect_attempts: Option<u32>,
    writer_queue_capacity: usize,
    required_features: Vec<u32>,
    idempotent_by_default: bool,
    #[cfg(feature = "tls")]
    tls: Option<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl Builder {
    pub fn new(endpoint: Endpoint) -> Builder {
        Builder {
            endpoint,
            credentials: None,
            connect_timeout: Duration::from_secs(30),
            default_deadline: None,
            backoff: Backoff::default(),
            max_reconnect_attempts: None,
            writer_queue_capacity: 1024,
            required_features: Vec::new(),
            idempotent_by_default: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn credentials(&mut self, user: impl Into<String>, password: impl Into<String>) -> &mut Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn default_deadline(&mut self, deadline: Duration) -> &mut Self {
        self.default_deadline = Some(deadline);
        self
    }

    pub fn backoff(&mut self, backoff: Backoff) -> &mut Self {
        self.backoff = backoff;
        self
    }

    pub fn max_reconnect_attempts(&mut self, max: u32) -> &mut Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    pub fn writer_queue_capacity(&mut self, capacity: usize) -> &mut Self {
        self.writer_queue_capacity = capacity;
        self
    }

    pub fn require_feature(&mut self, feature: u32) -> &mut Self {
        self.required_features.push(feature);
        self
    }

    pub fn idempotent_by_default(&mut self, value: bool) -> &mut Self {
        self.idempotent_by_default = value;
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(&mut self, tls_config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>) -> &mut Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn build(&self) -> Config {
        Config {
            endpoint: self.endpoint.clone(),
            credentials: self.credentials.clone(),
            connect_timeout: self.connect_timeout,
            default_deadline: self.default_deadline,
            backoff: self.backoff.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            writer_queue_capacity: self.writer_queue_capacity,
            required_features: self.required_features.clone(),
            idempotent_by_default: self.idempotent_by_default,
            #[cfg(feature = "tls")]
            tls: self.tls.clone(),
        }
    }
}
