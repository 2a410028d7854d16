//! Configuration resolved once, at startup, from an ordered list of sources.
//!
//! Later sources override earlier ones field by field. Only [`ConfigSource::environment`]
//! looks at process environment variables; everything downstream receives the resolved
//! [`MechConfig`].
//!
//! ```
//! use mech_kit::config::{self, ConfigSource, PartialConfig, chains::Gnosis};
//!
//! let config = config::resolve([
//!     ConfigSource::preset::<Gnosis>(),
//!     ConfigSource::Overrides(PartialConfig {
//!         response_timeout_secs: Some(600),
//!         ..Default::default()
//!     }),
//! ])
//! .unwrap();
//!
//! assert_eq!(config.chain_id, 100);
//! assert_eq!(config.response_timeout_secs, 600);
//! ```

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use alloy_primitives::{Address, address};
use mech_core::ledger::TxParams;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    orchestrator::DEFAULT_RESPONSE_TIMEOUT,
    receipt::{FlowSettings, ReceiptPolicy},
    retry::ReadRetry,
    subscription::SubscriptionContracts,
    watcher::WatchOptions,
};

/// Prefix of every environment variable the configuration reads.
pub const ENV_PREFIX: &str = "MECHX_";

/// Built-in settings for a chain the marketplace is deployed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPreset {
    pub name: &'static str,
    pub chain_id: u64,
    pub rpc_url: &'static str,
    pub marketplace: Address,
}

/// A chain known at compile time.
pub trait ExplicitChain {
    const PRESET: ChainPreset;
}

pub mod chains {
    use super::*;

    macro_rules! define_explicit_chain {
        ($struct_name:ident, $preset:expr) => {
            pub struct $struct_name;

            impl ExplicitChain for $struct_name {
                const PRESET: ChainPreset = $preset;
            }
        };
    }

    define_explicit_chain!(
        Gnosis,
        ChainPreset {
            name: "gnosis",
            chain_id: 100,
            rpc_url: "https://rpc.gnosischain.com",
            marketplace: address!("0x735FAAb1c4Ec41128c367AFb5c3baC73509f70bB"),
        }
    );
    define_explicit_chain!(
        Base,
        ChainPreset {
            name: "base",
            chain_id: 8453,
            rpc_url: "https://mainnet.base.org",
            marketplace: address!("0xf24eE42edA0fc9b33B7D41B06Ee8ccD2Ef7C5020"),
        }
    );
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// A configuration layer. Every field is optional; unset fields fall through to earlier
/// layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialConfig {
    pub chain_id: Option<u64>,
    pub rpc_url: Option<Url>,
    pub marketplace: Option<Address>,
    /// Proxy wallet to execute through; absent means direct execution.
    pub safe: Option<Address>,
    /// `true` forces direct execution, clearing a proxy set by an earlier layer.
    pub direct: Option<bool>,
    pub subscription: Option<SubscriptionContracts>,
    pub response_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub delivery_timeout_secs: Option<u64>,
    pub receipt_timeout_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub gas_limit: Option<u64>,
}

impl PartialConfig {
    /// Overlay `other` on top of `self`.
    pub fn merge(self, other: PartialConfig) -> PartialConfig {
        PartialConfig {
            chain_id: other.chain_id.or(self.chain_id),
            rpc_url: other.rpc_url.or(self.rpc_url),
            marketplace: other.marketplace.or(self.marketplace),
            safe: match (other.direct, other.safe) {
                (Some(true), _) => None,
                (_, Some(safe)) => Some(safe),
                _ => self.safe,
            },
            // Applied to `safe` above.
            direct: None,
            subscription: other.subscription.or(self.subscription),
            response_timeout_secs: other.response_timeout_secs.or(self.response_timeout_secs),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            delivery_timeout_secs: other.delivery_timeout_secs.or(self.delivery_timeout_secs),
            receipt_timeout_secs: other.receipt_timeout_secs.or(self.receipt_timeout_secs),
            retry_delay_ms: other.retry_delay_ms.or(self.retry_delay_ms),
            gas_limit: other.gas_limit.or(self.gas_limit),
        }
    }

    fn finish(self) -> Result<MechConfig, ConfigError> {
        if self.poll_interval_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "pollIntervalMs".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(MechConfig {
            chain_id: self.chain_id.ok_or(ConfigError::Missing("chainId"))?,
            rpc_url: self.rpc_url.ok_or(ConfigError::Missing("rpcUrl"))?,
            marketplace: self.marketplace.ok_or(ConfigError::Missing("marketplace"))?,
            safe: self.safe,
            subscription: self.subscription,
            response_timeout_secs: self
                .response_timeout_secs
                .unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(WatchOptions::DEFAULT_POLL_INTERVAL),
            delivery_timeout: self
                .delivery_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(MechConfig::DEFAULT_DELIVERY_TIMEOUT),
            receipt_timeout: self
                .receipt_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(ReceiptPolicy::DEFAULT_TIMEOUT),
            retry_delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(ReadRetry::DEFAULT_DELAY),
            gas_limit: self.gas_limit,
        })
    }
}

/// Where a configuration layer comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Defaults(ChainPreset),
    /// A snapshot of `MECHX_*` variables.
    Environment(BTreeMap<String, String>),
    Json(serde_json::Value),
    File(PathBuf),
    Overrides(PartialConfig),
}

impl ConfigSource {
    pub fn preset<C: ExplicitChain>() -> Self {
        ConfigSource::Defaults(C::PRESET)
    }

    /// Snapshot the current process environment.
    pub fn environment() -> Self {
        ConfigSource::Environment(
            std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
        )
    }

    fn into_partial(self) -> Result<PartialConfig, ConfigError> {
        match self {
            ConfigSource::Defaults(preset) => Ok(PartialConfig {
                chain_id: Some(preset.chain_id),
                rpc_url: Some(parse_value("rpcUrl", preset.rpc_url)?),
                marketplace: Some(preset.marketplace),
                ..Default::default()
            }),
            ConfigSource::Environment(vars) => from_env(&vars),
            ConfigSource::Json(value) => Ok(serde_json::from_value(value)?),
            ConfigSource::File(path) => {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                Ok(serde_json::from_str(&contents)?)
            }
            ConfigSource::Overrides(partial) => Ok(partial),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn from_env(vars: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    fn var<T: FromStr>(
        vars: &BTreeMap<String, String>,
        name: &str,
    ) -> Result<Option<T>, ConfigError> {
        let key = format!("{ENV_PREFIX}{name}");
        vars.get(&key)
            .filter(|value| !value.trim().is_empty())
            .map(|value| parse_value(&key, value))
            .transpose()
    }

    Ok(PartialConfig {
        chain_id: var(vars, "CHAIN_ID")?,
        rpc_url: var(vars, "RPC_URL")?,
        marketplace: var(vars, "MARKETPLACE")?,
        safe: var(vars, "SAFE_ADDRESS")?,
        direct: var(vars, "DIRECT")?,
        subscription: None,
        response_timeout_secs: var(vars, "RESPONSE_TIMEOUT")?,
        poll_interval_ms: var(vars, "POLL_INTERVAL_MS")?,
        delivery_timeout_secs: var(vars, "DELIVERY_TIMEOUT")?,
        receipt_timeout_secs: var(vars, "RECEIPT_TIMEOUT")?,
        retry_delay_ms: var(vars, "RETRY_DELAY_MS")?,
        gas_limit: var(vars, "GAS_LIMIT")?,
    })
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechConfig {
    pub chain_id: u64,
    pub rpc_url: Url,
    pub marketplace: Address,
    pub safe: Option<Address>,
    pub subscription: Option<SubscriptionContracts>,
    pub response_timeout_secs: u64,
    pub poll_interval: Duration,
    pub delivery_timeout: Duration,
    pub receipt_timeout: Duration,
    pub retry_delay: Duration,
    pub gas_limit: Option<u64>,
}

impl MechConfig {
    pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(900);

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            retry: ReadRetry::new(self.retry_delay),
            receipts: ReceiptPolicy {
                timeout: self.receipt_timeout,
                ..Default::default()
            },
            tx: TxParams {
                gas_limit: self.gas_limit,
                gas_price: None,
            },
        }
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            poll_interval: self.poll_interval,
            from_block: None,
        }
    }
}

/// Merge `sources` left to right into one configuration.
pub fn resolve(sources: impl IntoIterator<Item = ConfigSource>) -> Result<MechConfig, ConfigError> {
    let mut merged = PartialConfig::default();
    for source in sources {
        merged = merged.merge(source.into_partial()?);
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(?merged, "Resolved configuration");

    merged.finish()
}
