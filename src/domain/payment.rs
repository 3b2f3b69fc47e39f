use super::amount::{MilliSatoshi, Satoshi};
use crate::error::RpcError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Length of a compressed secp256k1 public key.
pub const NODE_ID_LEN: usize = 33;

/// Custom record types below this value are reserved by the protocol.
pub const CUSTOM_RECORD_TYPE_START: u64 = 65536;

/// A node's identity: a compressed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; NODE_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl From<bitcoin::secp256k1::PublicKey> for NodeId {
    fn from(key: bitcoin::secp256k1::PublicKey) -> Self {
        Self(key.serialize())
    }
}

/// The hash a payment is locked to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PaymentHash(pub [u8; 32]);

/// The secret whose hash is the payment hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    pub fn payment_hash(&self) -> PaymentHash {
        use bitcoin::hashes::{Hash, sha256};
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

hex_newtype!(NodeId, NODE_ID_LEN);
hex_newtype!(PaymentHash, 32);
hex_newtype!(Preimage, 32);

/// One hop of a route, from the perspective of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Short channel id of the channel used to reach `pub_key`.
    pub chan_id: u64,
    pub pub_key: NodeId,
    pub amt_to_forward: MilliSatoshi,
    pub fee: MilliSatoshi,
    pub expiry: u32,
    #[serde(default)]
    pub custom_records: BTreeMap<u64, Vec<u8>>,
}

/// An ordered sequence of hops from this node to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub total_time_lock: u32,
    pub total_amt: MilliSatoshi,
    pub total_fees: MilliSatoshi,
    pub hops: Vec<RouteHop>,
}

impl Route {
    /// Builds a route from its hops, computing the totals the way the sender
    /// pays them: every hop's fee plus the final amount.
    pub fn from_hops(total_time_lock: u32, hops: Vec<RouteHop>) -> Result<Self, RpcError> {
        let Some(last) = hops.last() else {
            return Err(RpcError::ValidationError(
                "empty route hops provided".to_string(),
            ));
        };
        let total_fees = hops
            .iter()
            .fold(MilliSatoshi::ZERO, |acc, hop| acc + hop.fee);
        let total_amt = last.amt_to_forward + total_fees;
        Ok(Self {
            total_time_lock,
            total_amt,
            total_fees,
            hops,
        })
    }

    pub fn destination(&self) -> Option<NodeId> {
        self.hops.last().map(|hop| hop.pub_key)
    }
}

/// A private channel hint carried by an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopHint {
    pub node_id: NodeId,
    pub chan_id: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// How much the sender is willing to pay in routing fees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeLimit {
    Fixed(Satoshi),
    FixedMsat(MilliSatoshi),
    Percent(Decimal),
}

impl FeeLimit {
    /// Resolves the limit against the payment amount. Without an explicit
    /// limit, `default_percent` of the amount is used.
    pub fn resolve(
        limit: Option<&FeeLimit>,
        amount: MilliSatoshi,
        default_percent: Decimal,
    ) -> Result<MilliSatoshi, RpcError> {
        match limit {
            Some(FeeLimit::Fixed(sat)) => Ok(sat.to_msat()),
            Some(FeeLimit::FixedMsat(msat)) => Ok(*msat),
            Some(FeeLimit::Percent(percent)) => amount.percent(*percent),
            None => amount.percent(default_percent),
        }
    }
}

/// A payment request as sent by a client. Fields from several modes may be
/// present at once; the resolver applies the precedence
/// route > invoice > manual.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentRequest {
    /// Raw destination key bytes.
    pub dest: Vec<u8>,
    /// Hex-encoded destination key, used when `dest` is empty.
    pub dest_string: String,
    /// Amount in whole satoshis.
    pub amt: u64,
    /// Amount in millisatoshis.
    pub amt_msat: u64,
    pub payment_hash: Vec<u8>,
    pub payment_hash_string: String,
    /// An encoded BOLT11 invoice.
    pub payment_request: String,
    pub final_cltv_delta: u32,
    pub fee_limit: Option<FeeLimit>,
    pub outgoing_chan_id: u64,
    pub last_hop_pubkey: Vec<u8>,
    pub cltv_limit: u32,
    pub dest_custom_records: BTreeMap<u64, Vec<u8>>,
    pub allow_self_payment: bool,
    pub dest_features: Vec<u16>,
    pub ignore_max_outbound_amt: bool,
    /// A prebuilt route. When set, only the payment hash is read besides it.
    pub route: Option<Route>,
}

impl PaymentRequest {
    /// The payment hash as declared by the client, if it is well formed.
    /// Used to tag error responses for requests that failed validation.
    pub fn declared_payment_hash(&self) -> PaymentHash {
        if !self.payment_hash_string.is_empty() {
            return self.payment_hash_string.parse().unwrap_or_default();
        }
        <[u8; 32]>::try_from(self.payment_hash.as_slice())
            .map(PaymentHash)
            .unwrap_or_default()
    }
}

/// A request to pay along a caller-supplied route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendToRouteRequest {
    pub payment_hash: Vec<u8>,
    pub payment_hash_string: String,
    pub route: Option<Route>,
}

impl TryFrom<SendToRouteRequest> for PaymentRequest {
    type Error = RpcError;

    fn try_from(req: SendToRouteRequest) -> Result<Self, Self::Error> {
        let Some(route) = req.route else {
            return Err(RpcError::ValidationError(
                "unable to send, no route provided".to_string(),
            ));
        };
        Ok(PaymentRequest {
            payment_hash: req.payment_hash,
            payment_hash_string: req.payment_hash_string,
            route: Some(route),
            ..Default::default()
        })
    }
}

/// The fields of a decoded invoice this core needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInvoice {
    pub payment_hash: PaymentHash,
    pub destination: NodeId,
    pub amount: Option<MilliSatoshi>,
    /// Creation time, as a duration since the unix epoch.
    pub timestamp: Duration,
    pub expiry: Duration,
    pub min_final_cltv_delta: u64,
    pub route_hints: Vec<Vec<HopHint>>,
    pub features: Vec<u16>,
    pub payment_addr: Option<[u8; 32]>,
}

impl DecodedInvoice {
    pub fn expires_at(&self) -> Duration {
        self.timestamp.saturating_add(self.expiry)
    }

    pub fn is_expired_at(&self, now: Duration) -> bool {
        now > self.expires_at()
    }
}

/// The canonical, validated description of one payment attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub amount: MilliSatoshi,
    pub fee_limit: MilliSatoshi,
    /// Absolute timelock ceiling for the whole route.
    pub cltv_limit: u32,
    /// Timelock delta required by the final hop.
    pub final_cltv_delta: u16,
    pub destination: NodeId,
    pub payment_hash: PaymentHash,
    pub route: Option<Route>,
    pub route_hints: Vec<Vec<HopHint>>,
    pub outgoing_chan_id: Option<u64>,
    pub last_hop: Option<NodeId>,
    pub dest_custom_records: BTreeMap<u64, Vec<u8>>,
    pub dest_features: Vec<u16>,
    pub payment_addr: Option<[u8; 32]>,
    /// The encoded invoice this intent was decoded from, if any.
    pub payment_request: Option<String>,
    pub ignore_max_outbound_amt: bool,
    pub allow_self_payment: bool,
}

/// Result of attempting one intent.
#[derive(Debug)]
pub enum DispatchOutcome {
    Succeeded { route: Route, preimage: Preimage },
    /// Rejected by the preflight or by the routing engine. Never retried.
    Failed(RpcError),
    /// The request never became an intent.
    Invalid(RpcError),
}

impl DispatchOutcome {
    pub fn into_response(self, payment_hash: PaymentHash) -> SendResponse {
        match self {
            DispatchOutcome::Succeeded { route, preimage } => SendResponse {
                payment_hash,
                payment_error: None,
                payment_preimage: Some(preimage),
                payment_route: Some(route),
            },
            DispatchOutcome::Failed(err) | DispatchOutcome::Invalid(err) => {
                SendResponse::error(payment_hash, &err)
            }
        }
    }
}

/// One response written back onto a payment stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub payment_hash: PaymentHash,
    pub payment_error: Option<String>,
    pub payment_preimage: Option<Preimage>,
    pub payment_route: Option<Route>,
}

impl SendResponse {
    pub fn error(payment_hash: PaymentHash, err: &RpcError) -> Self {
        Self {
            payment_hash,
            payment_error: Some(err.to_string()),
            payment_preimage: None,
            payment_route: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.payment_error.is_none()
    }
}
