#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{builder::DefaultState, Config, ConfigBuilder, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use mqlink_utils::{deserialize_duration, Bytesize};

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub client: Client,
    #[serde(default)]
    pub bench: Bench,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqlink/mqlink-bench").required(false))
            .add_source(File::with_name("mqlink-bench").required(false))
            .add_source(config::Environment::with_prefix("mqlink").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        Self::build(builder, opts)
    }

    fn build(builder: ConfigBuilder<DefaultState>, opts: Options) -> Result<Self> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(addr) = opts.addr.as_ref() {
            inner.bench.addr.clone_from(addr);
        }
        if let Some(mode) = opts.mode {
            inner.bench.mode = mode;
        }
        if let Some(messages) = opts.messages {
            inner.bench.messages = messages;
        }
        if let Some(qos) = opts.qos {
            inner.bench.qos = qos;
        }
        if let Some(client_id) = opts.client_id.as_ref() {
            inner.bench.client_id.clone_from(client_id);
        }
        if inner.bench.qos > 1 {
            return Err(anyhow!("bench.qos must be 0 or 1, got {}", inner.bench.qos));
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("broker addr is {}", cfg.bench.addr);
        log::info!("client id is {}", cfg.bench.client_id);
        log::info!("bench mode is {}, messages: {}, qos: {}", cfg.bench.mode, cfg.bench.messages, cfg.bench.qos);
        log::info!("client config is: {:?}", cfg.client);
        if let Some(cfg_name) = cfg.opts.cfg_name.as_ref() {
            log::info!("config file is {}", cfg_name);
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// Session tuning, consumed by `mqlink::Session`
#[derive(Clone, Deserialize)]
pub struct Client {
    //How long to wait for CONNACK.
    #[serde(default = "Client::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    //How long a QoS 1 publish waits for PUBACK, 0s waits forever.
    #[serde(default = "Client::publish_timeout_default", deserialize_with = "deserialize_duration")]
    pub publish_timeout: Duration,
    //Bound on the best-effort DISCONNECT write.
    #[serde(default = "Client::write_timeout_default", deserialize_with = "deserialize_duration")]
    pub write_timeout: Duration,
    #[serde(default = "Client::clean_start_default")]
    pub clean_start: bool,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub session_expiry_interval: Duration,
    //Receive Maximum announced to the server, 0 leaves it out.
    #[serde(default)]
    pub receive_max: u16,
    //Largest inbound packet accepted, also announced to the server.
    #[serde(default = "Client::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for Client {
    #[inline]
    fn default() -> Self {
        Self {
            connect_timeout: Self::connect_timeout_default(),
            publish_timeout: Self::publish_timeout_default(),
            write_timeout: Self::write_timeout_default(),
            clean_start: Self::clean_start_default(),
            session_expiry_interval: Duration::ZERO,
            receive_max: 0,
            max_packet_size: Self::max_packet_size_default(),
            username: None,
            password: None,
        }
    }
}

impl Client {
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn publish_timeout_default() -> Duration {
        Duration::from_secs(600)
    }
    fn write_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn clean_start_default() -> bool {
        true
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("clean_start", &self.clean_start)
            .field("session_expiry_interval", &self.session_expiry_interval)
            .field("receive_max", &self.receive_max)
            .field("max_packet_size", &self.max_packet_size)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bench {
    #[serde(default = "Bench::addr_default")]
    pub addr: String,
    #[serde(default = "Bench::client_id_default")]
    pub client_id: String,
    #[serde(default = "Bench::keep_alive_default")]
    pub keep_alive: u16,
    #[serde(default = "Bench::messages_default")]
    pub messages: usize,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "Bench::publish_topic_default")]
    pub publish_topic: String,
    #[serde(default = "Bench::subscribe_topic_default")]
    pub subscribe_topic: String,
    #[serde(default = "Bench::payload_default")]
    pub payload: String,
    #[serde(default = "Bench::qos_default")]
    pub qos: u8,
}

impl Default for Bench {
    #[inline]
    fn default() -> Self {
        Self {
            addr: Self::addr_default(),
            client_id: Self::client_id_default(),
            keep_alive: Self::keep_alive_default(),
            messages: Self::messages_default(),
            mode: Mode::default(),
            publish_topic: Self::publish_topic_default(),
            subscribe_topic: Self::subscribe_topic_default(),
            payload: Self::payload_default(),
            qos: Self::qos_default(),
        }
    }
}

impl Bench {
    fn addr_default() -> String {
        "127.0.0.1:1883".into()
    }
    fn client_id_default() -> String {
        "test-client".into()
    }
    fn keep_alive_default() -> u16 {
        30
    }
    fn messages_default() -> usize {
        10_000
    }
    fn publish_topic_default() -> String {
        "publisher-benchmark".into()
    }
    fn subscribe_topic_default() -> String {
        "subscriber-benchmark".into()
    }
    fn payload_default() -> String {
        "Hello World!".into()
    }
    fn qos_default() -> u8 {
        1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Publisher,
    Subscriber,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "publisher" | "pub" => Ok(Mode::Publisher),
            "subscriber" | "sub" => Ok(Mode::Subscriber),
            _ => Err(anyhow!("unknown bench mode, {}", s)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Publisher => write!(f, "publisher"),
            Mode::Subscriber => write!(f, "subscriber"),
        }
    }
}
