use crate::config::PaymentConfig;
use crate::domain::amount::{MSAT_PER_SAT, MilliSatoshi};
use crate::domain::payment::{
    CUSTOM_RECORD_TYPE_START, DecodedInvoice, FeeLimit, NodeId, PaymentHash, PaymentIntent,
    PaymentRequest, Route,
};
use crate::domain::ports::InvoiceDecoderRef;
use crate::error::{Result, RpcError};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Turns a loosely-typed [`PaymentRequest`] into one validated
/// [`PaymentIntent`].
///
/// Exactly one mode decides amount, destination and hash, in precedence
/// order: a prebuilt route, then an encoded invoice, then the manual fields.
/// Resolution only decodes and validates; it never talks to the network.
pub struct PaymentIntentResolver {
    self_node: NodeId,
    decoder: InvoiceDecoderRef,
    config: PaymentConfig,
}

impl PaymentIntentResolver {
    pub fn new(self_node: NodeId, decoder: InvoiceDecoderRef, config: PaymentConfig) -> Self {
        Self {
            self_node,
            decoder,
            config,
        }
    }

    pub fn resolve(&self, req: &PaymentRequest) -> Result<PaymentIntent> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.resolve_at(req, now)
    }

    /// Resolves against an explicit wall-clock time, given as a duration
    /// since the unix epoch.
    pub fn resolve_at(&self, req: &PaymentRequest, now: Duration) -> Result<PaymentIntent> {
        if let Some(route) = &req.route {
            trace!(hops = route.hops.len(), "resolving route payment");
            return self.resolve_route(req, route);
        }

        let restrictions = Restrictions::from_request(req, self.config.max_outgoing_cltv_expiry)?;

        if !req.payment_request.is_empty() {
            let invoice = self.decoder.decode(&req.payment_request)?;
            return self.resolve_invoice(req, invoice, restrictions, now);
        }

        self.resolve_manual(req, restrictions)
    }

    fn resolve_route(&self, req: &PaymentRequest, route: &Route) -> Result<PaymentIntent> {
        let payment_hash = parse_payment_hash(&req.payment_hash, &req.payment_hash_string)?;
        let Some(destination) = route.destination() else {
            return Err(validation("empty route hops provided"));
        };
        Ok(PaymentIntent {
            amount: route.total_amt,
            fee_limit: route.total_fees,
            cltv_limit: route.total_time_lock,
            final_cltv_delta: 0,
            destination,
            payment_hash,
            route: Some(route.clone()),
            route_hints: Vec::new(),
            outgoing_chan_id: None,
            last_hop: None,
            dest_custom_records: BTreeMap::new(),
            dest_features: Vec::new(),
            payment_addr: None,
            payment_request: None,
            ignore_max_outbound_amt: req.ignore_max_outbound_amt,
            allow_self_payment: req.allow_self_payment,
        })
    }

    fn resolve_invoice(
        &self,
        req: &PaymentRequest,
        invoice: DecodedInvoice,
        restrictions: Restrictions,
        now: Duration,
    ) -> Result<PaymentIntent> {
        if invoice.is_expired_at(now) {
            return Err(validation(format!(
                "invoice expired. Valid until {}",
                invoice.expires_at().as_secs()
            )));
        }

        let amount = match invoice.amount {
            Some(amount) => amount,
            None => {
                let amount = unmarshal_amount(req.amt, req.amt_msat)?;
                if amount.is_zero() {
                    return Err(validation(
                        "amount must be specified when paying a zero amount invoice",
                    ));
                }
                amount
            }
        };
        self.check_max_amount(amount)?;

        let fee_limit = FeeLimit::resolve(
            req.fee_limit.as_ref(),
            amount,
            self.config.default_fee_limit_percent,
        )?;
        let final_cltv_delta = u16::try_from(invoice.min_final_cltv_delta).map_err(|_| {
            validation(format!(
                "invoice final cltv delta of {} is too large",
                invoice.min_final_cltv_delta
            ))
        })?;

        self.check_destination(&invoice.destination, req.allow_self_payment)?;

        Ok(PaymentIntent {
            amount,
            fee_limit,
            cltv_limit: restrictions.cltv_limit,
            final_cltv_delta,
            destination: invoice.destination,
            payment_hash: invoice.payment_hash,
            route: None,
            route_hints: invoice.route_hints,
            outgoing_chan_id: restrictions.outgoing_chan_id,
            last_hop: restrictions.last_hop,
            dest_custom_records: restrictions.dest_custom_records,
            dest_features: invoice.features,
            payment_addr: invoice.payment_addr,
            payment_request: Some(req.payment_request.clone()),
            ignore_max_outbound_amt: req.ignore_max_outbound_amt,
            allow_self_payment: req.allow_self_payment,
        })
    }

    fn resolve_manual(&self, req: &PaymentRequest, restrictions: Restrictions) -> Result<PaymentIntent> {
        let key_bytes = if !req.dest.is_empty() {
            req.dest.clone()
        } else {
            hex::decode(&req.dest_string)
                .map_err(|e| validation(format!("invalid destination: {e}")))?
        };
        let destination =
            NodeId::from_slice(&key_bytes).ok_or_else(|| validation("invalid key length"))?;
        self.check_destination(&destination, req.allow_self_payment)?;

        let amount = unmarshal_amount(req.amt, req.amt_msat)?;
        if amount.is_zero() {
            return Err(validation(
                "amount must be specified when paying a node directly",
            ));
        }
        let fee_limit = FeeLimit::resolve(
            req.fee_limit.as_ref(),
            amount,
            self.config.default_fee_limit_percent,
        )?;

        let final_cltv_delta = match req.final_cltv_delta {
            0 => self.config.default_final_cltv_delta,
            delta => u16::try_from(delta).map_err(|_| {
                validation(format!("final cltv delta of {delta} is too large"))
            })?,
        };

        let payment_hash = parse_payment_hash(&req.payment_hash, &req.payment_hash_string)?;

        let mut dest_features = req.dest_features.clone();
        dest_features.sort_unstable();
        dest_features.dedup();

        self.check_max_amount(amount)?;

        Ok(PaymentIntent {
            amount,
            fee_limit,
            cltv_limit: restrictions.cltv_limit,
            final_cltv_delta,
            destination,
            payment_hash,
            route: None,
            route_hints: Vec::new(),
            outgoing_chan_id: restrictions.outgoing_chan_id,
            last_hop: restrictions.last_hop,
            dest_custom_records: restrictions.dest_custom_records,
            dest_features,
            payment_addr: None,
            payment_request: None,
            ignore_max_outbound_amt: req.ignore_max_outbound_amt,
            allow_self_payment: req.allow_self_payment,
        })
    }

    fn check_destination(&self, dest: &NodeId, allow_self_payment: bool) -> Result<()> {
        if !allow_self_payment && *dest == self.self_node {
            return Err(validation("self-payments not allowed"));
        }
        Ok(())
    }

    fn check_max_amount(&self, amount: MilliSatoshi) -> Result<()> {
        let max = self.config.max_payment_msat;
        if amount > max {
            return Err(validation(format!(
                "payment of {amount} is too large, max payment allowed is {max}"
            )));
        }
        Ok(())
    }
}

/// Path restrictions shared by the invoice and manual modes.
struct Restrictions {
    outgoing_chan_id: Option<u64>,
    last_hop: Option<NodeId>,
    cltv_limit: u32,
    dest_custom_records: BTreeMap<u64, Vec<u8>>,
}

impl Restrictions {
    fn from_request(req: &PaymentRequest, max_cltv_expiry: u32) -> Result<Self> {
        let outgoing_chan_id = (req.outgoing_chan_id != 0).then_some(req.outgoing_chan_id);

        let last_hop = if req.last_hop_pubkey.is_empty() {
            None
        } else {
            Some(
                NodeId::from_slice(&req.last_hop_pubkey)
                    .ok_or_else(|| validation("invalid vertex length"))?,
            )
        };

        let cltv_limit = validate_cltv_limit(req.cltv_limit, max_cltv_expiry)?;
        validate_custom_records(&req.dest_custom_records)?;

        Ok(Self {
            outgoing_chan_id,
            last_hop,
            cltv_limit,
            dest_custom_records: req.dest_custom_records.clone(),
        })
    }
}

fn validation(msg: impl Into<String>) -> RpcError {
    RpcError::ValidationError(msg.into())
}

/// Reads the payment hash from its hex form if present, else from raw bytes.
pub fn parse_payment_hash(raw: &[u8], hex_str: &str) -> Result<PaymentHash> {
    let bytes = if hex_str.is_empty() {
        raw.to_vec()
    } else {
        hex::decode(hex_str).map_err(|e| validation(format!("invalid payment hash: {e}")))?
    };
    <[u8; 32]>::try_from(bytes.as_slice())
        .map(PaymentHash)
        .map_err(|_| {
            validation(format!(
                "payment hash must be exactly 32 bytes, got {}",
                bytes.len()
            ))
        })
}

/// Combines the whole-satoshi and millisatoshi amount fields. Both may be
/// set only when they name the same amount.
pub fn unmarshal_amount(amt_sat: u64, amt_msat: u64) -> Result<MilliSatoshi> {
    let from_sat = MilliSatoshi::from_sat(amt_sat);
    match (amt_sat, amt_msat) {
        (0, msat) => Ok(MilliSatoshi(msat)),
        (_, 0) => Ok(from_sat),
        (sat, msat) if sat.checked_mul(MSAT_PER_SAT) == Some(msat) => Ok(from_sat),
        _ => Err(validation("amt and amt_msat are mutually exclusive")),
    }
}

/// A limit of zero means "use the maximum".
pub fn validate_cltv_limit(limit: u32, max: u32) -> Result<u32> {
    match limit {
        0 => Ok(max),
        limit if limit > max => Err(validation(format!(
            "total time lock of {limit} exceeds max allowed {max}"
        ))),
        limit => Ok(limit),
    }
}

pub fn validate_custom_records(records: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
    if records.keys().any(|ty| *ty < CUSTOM_RECORD_TYPE_START) {
        return Err(validation(format!(
            "no custom records with types below {CUSTOM_RECORD_TYPE_START} allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::amount::Satoshi;
    use crate::domain::payment::{NODE_ID_LEN, RouteHop};
    use crate::domain::ports::InvoiceDecoder;
    use std::collections::HashMap;
    use std::sync::Arc;

    const NOW: Duration = Duration::from_secs(1_700_000_000);

    fn node(tag: u8) -> NodeId {
        let mut key = [3u8; NODE_ID_LEN];
        key[32] = tag;
        NodeId(key)
    }

    struct StaticDecoder(HashMap<String, DecodedInvoice>);

    impl InvoiceDecoder for StaticDecoder {
        fn decode(&self, invoice: &str) -> Result<DecodedInvoice> {
            self.0
                .get(invoice)
                .cloned()
                .ok_or_else(|| validation("invalid invoice"))
        }
    }

    fn invoice(amount: Option<u64>, dest: NodeId) -> DecodedInvoice {
        DecodedInvoice {
            payment_hash: PaymentHash([9; 32]),
            destination: dest,
            amount: amount.map(MilliSatoshi),
            timestamp: NOW - Duration::from_secs(60),
            expiry: Duration::from_secs(3600),
            min_final_cltv_delta: 18,
            route_hints: Vec::new(),
            features: vec![9, 15],
            payment_addr: Some([4; 32]),
        }
    }

    fn resolver_with(invoices: Vec<(&str, DecodedInvoice)>) -> PaymentIntentResolver {
        let map = invoices
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        PaymentIntentResolver::new(
            node(0),
            Arc::new(StaticDecoder(map)),
            PaymentConfig::default(),
        )
    }

    fn manual(dest: NodeId, amt_msat: u64) -> PaymentRequest {
        PaymentRequest {
            dest: dest.0.to_vec(),
            amt_msat,
            payment_hash: vec![1; 32],
            ..Default::default()
        }
    }

    fn err_msg(result: Result<PaymentIntent>) -> String {
        result.unwrap_err().to_string()
    }

    #[test]
    fn test_manual_payment_resolves() {
        let resolver = resolver_with(vec![]);
        let intent = resolver.resolve_at(&manual(node(1), 50_000), NOW).unwrap();

        assert_eq!(intent.amount, MilliSatoshi(50_000));
        assert_eq!(intent.destination, node(1));
        assert_eq!(intent.payment_hash, PaymentHash([1; 32]));
        assert_eq!(intent.final_cltv_delta, 40);
        assert_eq!(intent.cltv_limit, 2016);
        // no explicit limit: 100% of the amount
        assert_eq!(intent.fee_limit, MilliSatoshi(50_000));
    }

    #[test]
    fn test_manual_hex_fields() {
        let resolver = resolver_with(vec![]);
        let req = PaymentRequest {
            dest_string: node(1).to_string(),
            amt: 10,
            payment_hash_string: "ab".repeat(32),
            final_cltv_delta: 144,
            ..Default::default()
        };
        let intent = resolver.resolve_at(&req, NOW).unwrap();
        assert_eq!(intent.amount, MilliSatoshi(10_000));
        assert_eq!(intent.payment_hash, PaymentHash([0xab; 32]));
        assert_eq!(intent.final_cltv_delta, 144);
    }

    #[test]
    fn test_manual_key_length() {
        let resolver = resolver_with(vec![]);
        let mut req = manual(node(1), 1_000);
        req.dest = vec![2; 32];
        assert_eq!(err_msg(resolver.resolve_at(&req, NOW)), "invalid key length");
    }

    #[test]
    fn test_self_payment_rejected_unless_allowed() {
        let resolver = resolver_with(vec![]);
        let mut req = manual(node(0), 1_000);
        assert_eq!(err_msg(resolver.resolve_at(&req, NOW)), "self-payments not allowed");

        req.allow_self_payment = true;
        assert!(resolver.resolve_at(&req, NOW).is_ok());
    }

    #[test]
    fn test_amount_fields() {
        assert_eq!(unmarshal_amount(5, 0).unwrap(), MilliSatoshi(5_000));
        assert_eq!(unmarshal_amount(0, 5).unwrap(), MilliSatoshi(5));
        assert_eq!(unmarshal_amount(5, 5_000).unwrap(), MilliSatoshi(5_000));
        assert!(unmarshal_amount(5, 4_000).is_err());
    }

    #[test]
    fn test_manual_zero_amount_rejected() {
        let resolver = resolver_with(vec![]);
        let msg = err_msg(resolver.resolve_at(&manual(node(1), 0), NOW));
        assert!(msg.starts_with("amount must be specified"));
    }

    #[test]
    fn test_max_payment_boundary() {
        let resolver = resolver_with(vec![]);
        let max = PaymentConfig::default().max_payment_msat.0;
        assert!(resolver.resolve_at(&manual(node(1), max), NOW).is_ok());

        let msg = err_msg(resolver.resolve_at(&manual(node(1), max + 1), NOW));
        assert_eq!(
            msg,
            "payment of 16777215001 msat is too large, max payment allowed is 16777215000 msat"
        );
    }

    #[test]
    fn test_manual_hash_must_be_32_bytes() {
        let resolver = resolver_with(vec![]);
        let mut req = manual(node(1), 1_000);
        req.payment_hash = vec![1; 31];
        assert!(resolver.resolve_at(&req, NOW).is_err());
    }

    #[test]
    fn test_restrictions() {
        let resolver = resolver_with(vec![]);
        let mut req = manual(node(1), 1_000);
        req.outgoing_chan_id = 77;
        req.last_hop_pubkey = node(2).0.to_vec();
        req.cltv_limit = 500;
        req.dest_custom_records.insert(70_000, vec![1, 2]);
        let intent = resolver.resolve_at(&req, NOW).unwrap();
        assert_eq!(intent.outgoing_chan_id, Some(77));
        assert_eq!(intent.last_hop, Some(node(2)));
        assert_eq!(intent.cltv_limit, 500);

        req.last_hop_pubkey = vec![1; 3];
        assert_eq!(err_msg(resolver.resolve_at(&req, NOW)), "invalid vertex length");

        req.last_hop_pubkey.clear();
        req.cltv_limit = 3000;
        assert_eq!(
            err_msg(resolver.resolve_at(&req, NOW)),
            "total time lock of 3000 exceeds max allowed 2016"
        );

        req.cltv_limit = 0;
        req.dest_custom_records.insert(5, vec![]);
        assert_eq!(
            err_msg(resolver.resolve_at(&req, NOW)),
            "no custom records with types below 65536 allowed"
        );
    }

    #[test]
    fn test_invoice_payment_takes_invoice_fields() {
        let resolver = resolver_with(vec![("lnbc1", invoice(Some(20_000), node(5)))]);
        let req = PaymentRequest {
            payment_request: "lnbc1".to_string(),
            // ignored: the invoice carries its own amount and destination
            amt: 1,
            dest: node(6).0.to_vec(),
            fee_limit: Some(FeeLimit::Fixed(Satoshi(2))),
            ..Default::default()
        };
        let intent = resolver.resolve_at(&req, NOW).unwrap();
        assert_eq!(intent.amount, MilliSatoshi(20_000));
        assert_eq!(intent.destination, node(5));
        assert_eq!(intent.payment_hash, PaymentHash([9; 32]));
        assert_eq!(intent.final_cltv_delta, 18);
        assert_eq!(intent.fee_limit, MilliSatoshi(2_000));
        assert_eq!(intent.payment_addr, Some([4; 32]));
        assert_eq!(intent.payment_request.as_deref(), Some("lnbc1"));
    }

    #[test]
    fn test_zero_amount_invoice() {
        let resolver = resolver_with(vec![("lnbc0", invoice(None, node(5)))]);
        let mut req = PaymentRequest {
            payment_request: "lnbc0".to_string(),
            ..Default::default()
        };
        assert_eq!(
            err_msg(resolver.resolve_at(&req, NOW)),
            "amount must be specified when paying a zero amount invoice"
        );

        req.amt_msat = 1_234;
        assert_eq!(
            resolver.resolve_at(&req, NOW).unwrap().amount,
            MilliSatoshi(1_234)
        );
    }

    #[test]
    fn test_expired_invoice_rejected() {
        let resolver = resolver_with(vec![("old", invoice(Some(1_000), node(5)))]);
        let req = PaymentRequest {
            payment_request: "old".to_string(),
            ..Default::default()
        };
        let later = NOW + Duration::from_secs(7200);
        assert!(err_msg(resolver.resolve_at(&req, later)).starts_with("invoice expired"));
    }

    #[test]
    fn test_invoice_to_self_rejected() {
        let resolver = resolver_with(vec![("me", invoice(Some(1_000), node(0)))]);
        let req = PaymentRequest {
            payment_request: "me".to_string(),
            ..Default::default()
        };
        assert_eq!(err_msg(resolver.resolve_at(&req, NOW)), "self-payments not allowed");
    }

    #[test]
    fn test_route_takes_precedence() {
        let resolver = resolver_with(vec![]);
        let route = Route::from_hops(
            200,
            vec![RouteHop {
                chan_id: 1,
                pub_key: node(0),
                amt_to_forward: MilliSatoshi(5_000),
                fee: MilliSatoshi(0),
                expiry: 200,
                custom_records: BTreeMap::new(),
            }],
        )
        .unwrap();
        // every manual field is wrong, none of them is looked at
        let req = PaymentRequest {
            dest: vec![1, 2, 3],
            amt: 5,
            amt_msat: 1,
            payment_request: "garbage".to_string(),
            payment_hash_string: "cd".repeat(32),
            route: Some(route.clone()),
            ..Default::default()
        };
        let intent = resolver.resolve_at(&req, NOW).unwrap();
        assert_eq!(intent.route, Some(route));
        assert_eq!(intent.amount, MilliSatoshi(5_000));
        assert_eq!(intent.payment_hash, PaymentHash([0xcd; 32]));
    }
}
