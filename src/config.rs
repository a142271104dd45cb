//! Configuration for the exchange.

use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{anyhow, ensure, Result};
use config::{Environment, File, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::Priority;

/// Environment variable prefix used by [`Config::load`].
pub const ENV_PREFIX: &str = "IROH_EXCHANGE";

/// The configuration for the exchange, split into the want side and the serving side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

/// Configuration of the local want side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often wants left behind by sessions that no longer exist are swept.
    #[serde(with = "humantime_serde")]
    pub want_sweep_interval: Duration,
    /// Priority used by sessions when the caller does not pick one.
    pub default_priority: Priority,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            want_sweep_interval: Duration::from_secs(30),
            default_priority: 1,
        }
    }
}

/// Configuration of the serving side and the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The number of workers draining the request queue and sending envelopes.
    pub task_worker_count: usize,
    /// Whether newly stored blocks are announced to the routing layer.
    pub provide_enabled: bool,
    /// The size of the buffer holding blocks waiting to be announced.
    pub has_block_buffer_size: usize,
    /// Approximately how much work is packed into a single envelope.
    pub target_message_size: usize,
    /// Describes approximately how much work we are will to have outstanding to a peer at any
    /// given time.
    /// Setting it to 0 will disable any limiting.
    pub max_outstanding_bytes_per_peer: usize,
    /// The maximum size of the block, in bytes, up to which we will
    /// replace a want-have with a want-block.
    pub max_replace_size: usize,
    /// Whether to answer wants for blocks we don't have with DONT_HAVE.
    pub send_dont_haves: bool,
    /// How many times a failed obligation is returned to the queue by the send workers.
    pub send_retry_budget: u32,
    /// Debt ratio above which a peer is served only after everyone else.
    pub debt_ratio_threshold: f64,
    /// How long the ledger of a disconnected peer is retained.
    #[serde(with = "humantime_serde")]
    pub ledger_retention: Duration,
    /// How often expired ledgers are released.
    #[serde(with = "humantime_serde")]
    pub ledger_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            task_worker_count: 8,
            provide_enabled: true,
            has_block_buffer_size: 256,
            target_message_size: 16 * 1024,
            max_outstanding_bytes_per_peer: 1 << 20,
            max_replace_size: 1024,
            send_dont_haves: true,
            send_retry_budget: 3,
            debt_ratio_threshold: 2.0,
            ledger_retention: Duration::from_secs(30),
            ledger_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Make a config using a default, files, environment variables, and overrides.
    ///
    /// Later items in the *file_paths* slice will have a higher priority than earlier ones.
    ///
    /// Environment variables are expected to start with the *env_prefix*. Nested fields are
    /// separated by `__`, eg `IROH_EXCHANGE__SERVER__TASK_WORKER_COUNT`.
    pub fn load<S, V>(
        file_paths: &[Option<&Path>],
        env_prefix: &str,
        flag_overrides: HashMap<S, V>,
    ) -> Result<Config>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = config::Config::builder();

        // layer on config options from files
        for path in file_paths.iter().flatten() {
            if path.exists() {
                let p = path.to_str().ok_or_else(|| anyhow!("empty path"))?;
                builder = builder.add_source(File::with_name(p));
            }
        }

        // next, add any environment variables
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        // finally, override any values
        for (flag, val) in flag_overrides.into_iter() {
            builder = builder.set_override(flag.as_ref(), val)?;
        }

        let cfg = builder.build()?;
        debug!("make_config:\n{:#?}\n", cfg);
        let cfg: Config = cfg.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the exchange cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.server.target_message_size > 0,
            "server.target_message_size must be at least 1"
        );
        ensure!(
            self.server.debt_ratio_threshold >= 0.0,
            "server.debt_ratio_threshold must not be negative"
        );
        Ok(())
    }
}
