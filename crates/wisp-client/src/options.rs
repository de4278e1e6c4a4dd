//! Client configuration
//!
//! One typed [`Options`] record built through [`ClientBuilder`]. Connection
//! URLs accept `nats://host:port` and `tls://host:port`; scheme and port are
//! optional. Credentials embedded in a URL authority fill in only the fields
//! the caller did not set explicitly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use wisp_transport::TlsConfig;

use crate::auth::{parse_creds, Creds, NonceSigner, SeedSigner};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::events::{ClientEvents, NullEvents};

/// How delivered payloads are decoded before reaching callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    /// Hand the raw bytes through untouched
    Binary,
    /// Decode UTF-8 (lossy)
    #[default]
    Text,
    /// Parse JSON; parse failures are delivered as the message
    Json,
}

/// TLS negotiation stance
#[derive(Clone, Default)]
pub enum TlsMode {
    /// Plain TCP; refuse servers that require TLS
    #[default]
    Off,
    /// Upgrade to TLS after INFO, with the given configuration
    On(TlsConfig),
}

impl TlsMode {
    pub fn is_on(&self) -> bool {
        matches!(self, TlsMode::On(_))
    }
}

/// Source for the user JWT sent during key authentication
#[derive(Clone)]
pub enum JwtSource {
    Literal(String),
    Callback(Arc<dyn Fn() -> String + Send + Sync>),
}

impl JwtSource {
    pub(crate) fn resolve(&self) -> String {
        match self {
            JwtSource::Literal(jwt) => jwt.clone(),
            JwtSource::Callback(f) => f(),
        }
    }
}

/// Resolved client configuration
#[derive(Clone)]
pub struct Options {
    pub(crate) servers: Vec<String>,
    pub(crate) url: Option<String>,
    pub(crate) no_randomize: bool,
    pub(crate) reconnect: bool,
    /// -1 means unbounded
    pub(crate) max_reconnect_attempts: i32,
    pub(crate) reconnect_time_wait: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_ping_out: u32,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) tls: TlsMode,
    pub(crate) payload: PayloadMode,
    pub(crate) use_old_request_style: bool,
    pub(crate) name: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) pass: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) nkey: Option<String>,
    pub(crate) user_jwt: Option<JwtSource>,
    pub(crate) signer: Option<Arc<dyn NonceSigner>>,
    pub(crate) creds: Option<Creds>,
    pub(crate) yield_time: Option<Duration>,
    pub(crate) wait_on_first_connect: bool,
    pub(crate) events: Arc<dyn ClientEvents>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            url: None,
            no_randomize: false,
            reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_time_wait: Duration::from_millis(2000),
            ping_interval: Duration::from_millis(120_000),
            max_ping_out: 2,
            verbose: false,
            pedantic: false,
            tls: TlsMode::Off,
            payload: PayloadMode::Text,
            use_old_request_style: false,
            name: None,
            user: None,
            pass: None,
            token: None,
            nkey: None,
            user_jwt: None,
            signer: None,
            creds: None,
            yield_time: None,
            wait_on_first_connect: false,
            events: Arc::new(NullEvents),
        }
    }
}

/// Builder for a [`Client`]
pub struct ClientBuilder {
    opts: Options,
    creds_content: Option<String>,
    seed_signer: Option<Arc<SeedSigner>>,
}

impl ClientBuilder {
    /// New builder pointed at a single server
    pub fn new(url: &str) -> Self {
        let mut opts = Options::default();
        opts.url = Some(url.to_string());
        Self {
            opts,
            creds_content: None,
            seed_signer: None,
        }
    }

    /// New builder with a server list
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts = Options::default();
        opts.servers = servers.into_iter().map(Into::into).collect();
        Self {
            opts,
            creds_content: None,
            seed_signer: None,
        }
    }

    /// Set the client name announced in CONNECT
    pub fn name(mut self, name: &str) -> Self {
        self.opts.name = Some(name.to_string());
        self
    }

    /// Keep the seeded server order instead of shuffling
    pub fn no_randomize(mut self) -> Self {
        self.opts.no_randomize = true;
        self
    }

    /// Enable/disable auto-reconnect
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.opts.reconnect = enabled;
        self
    }

    /// Maximum reconnect attempts per server; -1 for unbounded
    pub fn max_reconnect_attempts(mut self, max: i32) -> Self {
        self.opts.max_reconnect_attempts = max;
        self
    }

    /// Delay before redialing a server that had connected before
    pub fn reconnect_time_wait(mut self, wait: Duration) -> Self {
        self.opts.reconnect_time_wait = wait;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.opts.ping_interval = interval;
        self
    }

    /// Unanswered PINGs tolerated before the connection is declared stale
    pub fn max_ping_out(mut self, max: u32) -> Self {
        self.opts.max_ping_out = max;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.opts.verbose = verbose;
        self
    }

    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.opts.pedantic = pedantic;
        self
    }

    /// Upgrade to TLS after INFO
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.opts.tls = TlsMode::On(config);
        self
    }

    /// Payload decoding for delivered messages
    pub fn payload(mut self, mode: PayloadMode) -> Self {
        self.opts.payload = mode;
        self
    }

    /// Use a dedicated subscription per request instead of the shared mux
    pub fn use_old_request_style(mut self, enabled: bool) -> Self {
        self.opts.use_old_request_style = enabled;
        self
    }

    pub fn user_pass(mut self, user: &str, pass: &str) -> Self {
        self.opts.user = Some(user.to_string());
        self.opts.pass = Some(pass.to_string());
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.opts.token = Some(token.to_string());
        self
    }

    /// Public key identity; the signer proves possession of the seed
    pub fn nkey(mut self, public_key: &str, signer: Arc<dyn NonceSigner>) -> Self {
        self.opts.nkey = Some(public_key.to_string());
        self.opts.signer = Some(signer);
        self
    }

    /// Install a nonce signer without an nkey (used with a literal JWT)
    pub fn nonce_signer(mut self, signer: Arc<dyn NonceSigner>) -> Self {
        self.opts.signer = Some(signer);
        self
    }

    /// Literal user JWT
    pub fn user_jwt(mut self, jwt: &str) -> Self {
        self.opts.user_jwt = Some(JwtSource::Literal(jwt.to_string()));
        self
    }

    /// JWT produced on demand
    pub fn user_jwt_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.opts.user_jwt = Some(JwtSource::Callback(Arc::new(f)));
        self
    }

    /// Chained credentials: a user JWT and an nkey seed in fenced blocks
    pub fn credentials_content(mut self, content: &str) -> Self {
        self.creds_content = Some(content.to_string());
        self
    }

    /// Load chained credentials from a file
    pub fn credentials_file(self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(self.credentials_content(&content))
    }

    /// Signing primitive used with chained credentials: derives a signature
    /// over the nonce from the seed. The cryptography lives with the caller.
    pub fn seed_signer<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.seed_signer = Some(Arc::new(f));
        self
    }

    /// Hand the scheduler back once a parse run exceeds this limit
    pub fn yield_time(mut self, limit: Duration) -> Self {
        self.opts.yield_time = Some(limit);
        self
    }

    /// Keep initial dial failures in the rotation instead of purging them
    pub fn wait_on_first_connect(mut self, enabled: bool) -> Self {
        self.opts.wait_on_first_connect = enabled;
        self
    }

    /// Install the event observer
    pub fn events(mut self, events: Arc<dyn ClientEvents>) -> Self {
        self.opts.events = events;
        self
    }

    /// Resolve the options without connecting
    pub fn build(mut self) -> Result<Options> {
        if self.opts.url.is_none() && self.opts.servers.is_empty() {
            return Err(Error::BadOptions("no servers configured".into()));
        }
        if self.opts.user.is_some() && self.opts.token.is_some() {
            return Err(Error::BadAuthentication);
        }
        if let Some(content) = self.creds_content.take() {
            let creds = parse_creds(&content)?;
            if let Some(seed_signer) = self.seed_signer.take() {
                let seed = creds.seed.clone();
                let signer = move |nonce: &[u8]| -> Result<Vec<u8>> { seed_signer(&seed, nonce) };
                self.opts.signer = Some(Arc::new(signer));
            }
            self.opts.creds = Some(creds);
        }
        Ok(self.opts)
    }

    /// Build and connect
    pub async fn connect(self) -> Result<Client> {
        let opts = self.build()?;
        Client::connect_with(opts).await
    }
}
