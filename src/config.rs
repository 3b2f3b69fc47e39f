use crate::domain::amount::{MilliSatoshi, Satoshi};
use crate::error::{Result, RpcError};
use bitcoin::Network;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest channel a node will fund, 2^24 - 1 satoshis.
pub const MAX_FUNDING_SAT: u64 = 16_777_215;

/// Limits and defaults of the RPC orchestration core.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub payments: PaymentConfig,
    pub channels: ChannelConfig,
    pub acceptor: AcceptorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub max_payment_msat: MilliSatoshi,
    /// Fee limit applied when a request carries none, as a percentage of the
    /// payment amount.
    pub default_fee_limit_percent: Decimal,
    pub max_outgoing_cltv_expiry: u32,
    pub default_final_cltv_delta: u16,
    /// Ceiling of concurrently dispatched payments per stream.
    pub max_in_flight: usize,
    /// Weight of one more HTLC output on the commitment, in bytes.
    pub htlc_output_size: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            max_payment_msat: Satoshi(MAX_FUNDING_SAT).to_msat(),
            default_fee_limit_percent: dec!(100),
            max_outgoing_cltv_expiry: 2016,
            default_final_cltv_delta: 40,
            max_in_flight: 2000,
            htlc_output_size: 43,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub min_funding_sat: Satoshi,
    pub max_funding_sat: Satoshi,
    pub network: Network,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            min_funding_sat: Satoshi(20_000),
            max_funding_sat: Satoshi(MAX_FUNDING_SAT),
            network: Network::Regtest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    pub timeout_secs: u64,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl AcceptorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RpcConfig {
    /// Loads a config from a JSON file and checks it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RpcConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.payments.max_in_flight == 0 {
            return Err(RpcError::ConfigError(
                "payments.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.payments.default_fee_limit_percent.is_sign_negative() {
            return Err(RpcError::ConfigError(
                "payments.default_fee_limit_percent cannot be negative".to_string(),
            ));
        }
        if self.channels.min_funding_sat > self.channels.max_funding_sat {
            return Err(RpcError::ConfigError(format!(
                "channels.min_funding_sat ({}) exceeds channels.max_funding_sat ({})",
                self.channels.min_funding_sat, self.channels.max_funding_sat
            )));
        }
        if self.acceptor.timeout_secs == 0 {
            return Err(RpcError::ConfigError(
                "acceptor.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
