use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Suffix appended to the configured exchange base name.
pub const EXCHANGE_SUFFIX: &str = "_direct";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub routing_key: String,
    pub exchange: String,
    #[serde(default = "default_num_queues")]
    pub num_queues: usize,
    #[serde(default)]
    pub bind_by_id: bool,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_rows_per_message")]
    pub rows_per_message: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connection_setup_sleep_ms")]
    pub connection_setup_sleep_ms: u64,
    #[serde(default = "default_loop_retries_max")]
    pub loop_retries_max: usize,
    #[serde(default = "default_loop_wait_ms")]
    pub loop_wait_ms: u64,
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Unset means the exchange check waits for as long as it takes.
    #[serde(default)]
    pub exchange_check_timeout_ms: Option<u64>,
}

impl ProducerConfig {
    /// Builds a configuration with every tunable at its default.
    pub fn new(host: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            routing_key: String::new(),
            exchange: exchange.into(),
            num_queues: default_num_queues(),
            bind_by_id: false,
            transactional: false,
            delimiter: None,
            rows_per_message: default_rows_per_message(),
            chunk_size: default_chunk_size(),
            connection_setup_sleep_ms: default_connection_setup_sleep_ms(),
            loop_retries_max: default_loop_retries_max(),
            loop_wait_ms: default_loop_wait_ms(),
            batch: default_batch(),
            exchange_check_timeout_ms: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ROW_PRODUCER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows_per_message == 0 {
            return Err(Error::InvalidConfig("rows_per_message must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be at least 1".to_string()));
        }
        if self.num_queues == 0 {
            return Err(Error::InvalidConfig("num_queues must be at least 1".to_string()));
        }
        if self.batch == 0 {
            return Err(Error::InvalidConfig("batch must be at least 1".to_string()));
        }
        if self.loop_retries_max == 0 {
            return Err(Error::InvalidConfig("loop_retries_max must be at least 1".to_string()));
        }
        if let Some(delim) = self.delimiter {
            if !delim.is_ascii() {
                return Err(Error::InvalidConfig(format!(
                    "delimiter must be a single byte, got {:?}",
                    delim
                )));
            }
        }
        Ok(())
    }

    pub fn amqp_uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }

    pub fn exchange_name(&self) -> String {
        format!("{}{}", self.exchange, EXCHANGE_SUFFIX)
    }

    /// The delimiter as the single byte it occupies in the row stream.
    pub fn delimiter_byte(&self) -> Option<u8> {
        self.delimiter.filter(char::is_ascii).map(|c| c as u8)
    }

    pub fn connection_setup_sleep(&self) -> Duration {
        Duration::from_millis(self.connection_setup_sleep_ms)
    }

    pub fn loop_wait(&self) -> Duration {
        Duration::from_millis(self.loop_wait_ms)
    }

    pub fn exchange_check_timeout(&self) -> Option<Duration> {
        self.exchange_check_timeout_ms.map(Duration::from_millis)
    }
}

fn default_port() -> u16 {
    5672
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_num_queues() -> usize {
    1
}

fn default_rows_per_message() -> usize {
    1
}

fn default_chunk_size() -> usize {
    4096
}

fn default_connection_setup_sleep_ms() -> u64 {
    200
}

fn default_loop_retries_max() -> usize {
    1000
}

fn default_loop_wait_ms() -> u64 {
    10
}

fn default_batch() -> usize {
    10_000
}
