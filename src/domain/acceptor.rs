use super::amount::{FeePerKb, MilliSatoshi, Satoshi};
use super::payment::NodeId;
use serde::{Deserialize, Serialize};

/// Temporary identifier of an inbound channel under negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PendingChannelId(pub [u8; 32]);

hex_newtype!(PendingChannelId, 32);

/// An inbound channel proposal forwarded to the external decision-maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceRequest {
    pub node_pubkey: NodeId,
    pub chain_hash: [u8; 32],
    pub pending_chan_id: PendingChannelId,
    pub funding_amt: Satoshi,
    pub push_amt: MilliSatoshi,
    pub dust_limit: Satoshi,
    pub max_value_in_flight: MilliSatoshi,
    pub channel_reserve: Satoshi,
    pub min_htlc: MilliSatoshi,
    pub fee_per_kb: FeePerKb,
    pub csv_delay: u16,
    pub max_accepted_htlcs: u16,
    pub channel_flags: u8,
}

/// The decision-maker's reply to one [`AcceptanceRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceDecision {
    pub pending_chan_id: PendingChannelId,
    pub accept: bool,
}
