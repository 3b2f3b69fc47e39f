use crate::domain::amount::MilliSatoshi;
use crate::domain::payment::{DecodedInvoice, HopHint, NodeId, PaymentHash};
use crate::domain::ports::InvoiceDecoder;
use crate::error::{Result, RpcError};
use bitcoin::Network;
use bitcoin::hashes::Hash;
use lightning_invoice::{Bolt11Invoice, Currency};
use std::str::FromStr;

/// Decodes BOLT11 invoices for one network.
pub struct Bolt11Decoder {
    network: Network,
}

impl Bolt11Decoder {
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

fn currency_matches(currency: &Currency, network: Network) -> bool {
    matches!(
        (currency, network),
        (Currency::Bitcoin, Network::Bitcoin)
            | (Currency::BitcoinTestnet, Network::Testnet)
            | (Currency::Regtest, Network::Regtest)
            | (Currency::Simnet, Network::Regtest)
            | (Currency::Signet, Network::Signet)
    )
}

/// Indices of the set bits of a little-endian feature bitmap.
fn feature_bits(le_flags: &[u8]) -> Vec<u16> {
    le_flags
        .iter()
        .enumerate()
        .flat_map(|(byte_idx, byte)| {
            (0..8u16)
                .filter(move |bit| byte & (1 << bit) != 0)
                .map(move |bit| byte_idx as u16 * 8 + bit)
        })
        .collect()
}

impl InvoiceDecoder for Bolt11Decoder {
    fn decode(&self, invoice: &str) -> Result<DecodedInvoice> {
        let parsed = Bolt11Invoice::from_str(invoice.trim())
            .map_err(|e| RpcError::ValidationError(format!("invalid payment request: {e}")))?;

        let currency = parsed.currency();
        if !currency_matches(&currency, self.network) {
            return Err(RpcError::ValidationError(format!(
                "invoice is for {currency}, this node runs on {}",
                self.network
            )));
        }

        let payee = parsed
            .payee_pub_key()
            .copied()
            .unwrap_or_else(|| parsed.recover_payee_pub_key());

        let route_hints = parsed
            .route_hints()
            .into_iter()
            .map(|hint| {
                hint.0
                    .into_iter()
                    .map(|hop| HopHint {
                        node_id: NodeId::from(hop.src_node_id),
                        chan_id: hop.short_channel_id,
                        fee_base_msat: hop.fees.base_msat,
                        fee_proportional_millionths: hop.fees.proportional_millionths,
                        cltv_expiry_delta: hop.cltv_expiry_delta,
                    })
                    .collect()
            })
            .collect();

        Ok(DecodedInvoice {
            payment_hash: PaymentHash(parsed.payment_hash().to_byte_array()),
            destination: NodeId::from(payee),
            amount: parsed.amount_milli_satoshis().map(MilliSatoshi),
            timestamp: parsed.duration_since_epoch(),
            expiry: parsed.expiry_time(),
            min_final_cltv_delta: parsed.min_final_cltv_expiry_delta(),
            route_hints,
            features: parsed
                .features()
                .map(|features| feature_bits(features.le_flags()))
                .unwrap_or_default(),
            payment_addr: Some(parsed.payment_secret().0),
        })
    }
}
