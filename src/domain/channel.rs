use super::amount::{FeePerKb, MilliSatoshi, Satoshi};
use super::payment::NodeId;
use crate::error::{Result, RpcError};
use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The funding transaction id of a channel point, as raw bytes or as the
/// usual byte-reversed hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingTxid {
    Bytes(Vec<u8>),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub funding_txid: FundingTxid,
    pub output_index: u32,
}

impl ChannelPoint {
    pub fn txid(&self) -> Result<Txid> {
        match &self.funding_txid {
            FundingTxid::Bytes(bytes) => Txid::from_slice(bytes)
                .map_err(|e| RpcError::ValidationError(format!("invalid funding txid: {e}"))),
            FundingTxid::Str(s) => Txid::from_str(s)
                .map_err(|e| RpcError::ValidationError(format!("invalid funding txid: {e}"))),
        }
    }

    pub fn to_outpoint(&self) -> Result<OutPoint> {
        Ok(OutPoint::new(self.txid()?, self.output_index))
    }
}

impl From<OutPoint> for ChannelPoint {
    fn from(outpoint: OutPoint) -> Self {
        Self {
            funding_txid: FundingTxid::Bytes(outpoint.txid.to_byte_array().to_vec()),
            output_index: outpoint.vout,
        }
    }
}

/// The 32-byte channel id derived from a funding outpoint: the txid with the
/// output index XORed into its last two bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

hex_newtype!(ChannelId, 32);

impl ChannelId {
    pub fn from_outpoint(outpoint: &OutPoint) -> Self {
        let mut id = outpoint.txid.to_byte_array();
        id[30] ^= (outpoint.vout >> 8) as u8;
        id[31] ^= outpoint.vout as u8;
        Self(id)
    }
}

/// A progress event of one channel open or close call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelLifecycleEvent {
    /// A funding or closing transaction was broadcast.
    Pending { txid: Txid, output_index: u32 },
    /// The funding transaction confirmed and the channel is usable.
    Open { channel_point: OutPoint },
    /// A cooperative close is being negotiated.
    Closing { closing_txid: Txid },
    /// The closing transaction confirmed.
    Closed { closing_txid: Txid, success: bool },
}

impl ChannelLifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelLifecycleEvent::Open { .. } | ChannelLifecycleEvent::Closed { .. }
        )
    }
}

/// One notification on a channel engine feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotification {
    Update(ChannelLifecycleEvent),
    Error(String),
}

/// Fee preference for an on-chain transaction: a fixed rate wins over a
/// confirmation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeePreference {
    pub target_conf: u32,
    pub sat_per_byte: u64,
}

impl FeePreference {
    pub fn is_set(&self) -> bool {
        self.target_conf != 0 || self.sat_per_byte != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenChannelRequest {
    pub node_pubkey: Vec<u8>,
    /// Hex form of the key, used by the synchronous variant.
    pub node_pubkey_string: String,
    pub local_funding_amount: Satoshi,
    pub push_sat: Satoshi,
    pub target_conf: u32,
    pub sat_per_byte: u64,
    pub private: bool,
    pub min_htlc_msat: MilliSatoshi,
    pub remote_csv_delay: u16,
    pub min_confs: i32,
    pub spend_unconfirmed: bool,
    pub close_address: String,
}

impl OpenChannelRequest {
    pub fn fee_preference(&self) -> FeePreference {
        FeePreference {
            target_conf: self.target_conf,
            sat_per_byte: self.sat_per_byte,
        }
    }
}

/// A fully validated open-channel request handed to the channel engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenChannelParams {
    pub target: NodeId,
    pub local_funding: Satoshi,
    pub push: MilliSatoshi,
    pub min_htlc_in: MilliSatoshi,
    pub funding_fee_rate: FeePerKb,
    pub private: bool,
    pub remote_csv_delay: u16,
    pub min_confs: u32,
    pub shutdown_script: Option<ScriptBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseChannelRequest {
    pub channel_point: Option<ChannelPoint>,
    pub force: bool,
    pub target_conf: u32,
    pub sat_per_byte: u64,
    pub delivery_address: String,
}

impl CloseChannelRequest {
    pub fn fee_preference(&self) -> FeePreference {
        FeePreference {
            target_conf: self.target_conf,
            sat_per_byte: self.sat_per_byte,
        }
    }
}

/// Live state of one open channel, as seen by the preflight and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_point: OutPoint,
    pub short_channel_id: u64,
    pub remote_node: NodeId,
    pub local_balance: MilliSatoshi,
    pub remote_balance: MilliSatoshi,
    /// Reserve the remote party requires us to keep.
    pub local_reserve: Satoshi,
    /// Reserve we require the remote party to keep.
    pub remote_reserve: Satoshi,
    #[serde(default)]
    pub active_htlcs: usize,
}

/// Forwarding state of a channel's link in the HTLC switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub eligible_to_forward: bool,
}

/// Resolves the number of confirmations funding inputs need.
pub fn resolve_min_confs(min_confs: i32, spend_unconfirmed: bool) -> Result<u32> {
    match (min_confs, spend_unconfirmed) {
        (n, _) if n < 0 => Err(RpcError::ValidationError(
            "minimum number of confirmations must be a non-negative number".to_string(),
        )),
        (0, false) => Ok(1),
        (n, true) if n > 0 => Err(RpcError::ValidationError(
            "SpendUnconfirmed set to true with MinConfs > 0".to_string(),
        )),
        (_, true) => Ok(0),
        (n, false) => Ok(n as u32),
    }
}

/// Parses an optional on-chain address into the script paying to it. Errors
/// carry the bare parser message so callers can say which address was bad.
pub fn parse_address_script(address: &str, network: Network) -> Result<Option<ScriptBuf>> {
    if address.is_empty() {
        return Ok(None);
    }
    let unchecked = Address::<NetworkUnchecked>::from_str(address)
        .map_err(|e| RpcError::ValidationError(e.to_string()))?;
    let address = unchecked
        .require_network(network)
        .map_err(|e| RpcError::ValidationError(e.to_string()))?;
    Ok(Some(address.script_pubkey()))
}
