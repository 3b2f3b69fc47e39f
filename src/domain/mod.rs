//! Domain layer: the value types exchanged with clients and the ports through
//! which the orchestration talks to the node's engines.

/// Implements hex `Display`/`FromStr` and hex-string serde for a fixed-size
/// byte newtype.
macro_rules! hex_newtype {
    ($name:ident, $len:expr) => {
        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&::hex::encode(self.0))
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::RpcError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                let bytes = ::hex::decode(s).map_err(|e| {
                    $crate::error::RpcError::ValidationError(format!(
                        "invalid hex for {}: {e}",
                        stringify!($name)
                    ))
                })?;
                <[u8; $len]>::try_from(bytes.as_slice())
                    .map(Self)
                    .map_err(|_| {
                        $crate::error::RpcError::ValidationError(format!(
                            "{} must be {} bytes, got {}",
                            stringify!($name),
                            $len,
                            bytes.len()
                        ))
                    })
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&::hex::encode(self.0))
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::std::result::Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

pub mod acceptor;
pub mod amount;
pub mod channel;
pub mod payment;
pub mod ports;
