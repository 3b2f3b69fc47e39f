use crate::error::RpcError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const MSAT_PER_SAT: u64 = 1000;

/// An exact amount of millisatoshis.
///
/// This is the unit payments are expressed in. Arithmetic saturates rather
/// than wrapping so a malformed request can never produce a tiny amount.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MilliSatoshi(pub u64);

/// An exact amount of whole satoshis, the unit channel balances settle in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Satoshi(pub u64);

impl MilliSatoshi {
    pub const ZERO: Self = Self(0);

    pub fn from_sat(sat: u64) -> Self {
        Self(sat.saturating_mul(MSAT_PER_SAT))
    }

    pub fn msat(&self) -> u64 {
        self.0
    }

    /// Floors to whole satoshis.
    pub fn to_sat(&self) -> Satoshi {
        Satoshi(self.0 / MSAT_PER_SAT)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns `percent`% of this amount, rounded down.
    pub fn percent(&self, percent: Decimal) -> Result<Self, RpcError> {
        if percent.is_sign_negative() {
            return Err(RpcError::ValidationError(
                "fee limit percentage cannot be negative".to_string(),
            ));
        }
        let scaled = (Decimal::from(self.0) * percent / Decimal::ONE_HUNDRED).floor();
        scaled.to_u64().map(Self).ok_or_else(|| {
            RpcError::ValidationError(format!("fee limit of {percent}% overflows"))
        })
    }
}

impl Satoshi {
    pub const ZERO: Self = Self(0);

    pub fn sat(&self) -> u64 {
        self.0
    }

    pub fn to_msat(&self) -> MilliSatoshi {
        MilliSatoshi::from_sat(self.0)
    }
}

impl fmt::Display for MilliSatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} msat", self.0)
    }
}

impl fmt::Display for Satoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

impl Add for MilliSatoshi {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MilliSatoshi {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign for MilliSatoshi {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl SubAssign for MilliSatoshi {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Add for Satoshi {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Satoshi {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// A fee rate in satoshis per 1000 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FeePerKb(pub u64);

impl FeePerKb {
    pub fn from_sat_per_byte(sat_per_byte: u64) -> Self {
        Self(sat_per_byte.saturating_mul(1000))
    }

    /// The fee for a transaction (or output) of `size` bytes.
    pub fn fee_for_size(&self, size: u64) -> Satoshi {
        Satoshi(self.0.saturating_mul(size) / 1000)
    }
}
