//! Enumerations carried in frames and across the C boundary.
//!
//! Internally these are tagged variants. The integer mappings below are the
//! only representation used on the wire and at the process boundary:
//!
//! | Type        | 0        | 1        |
//! |-------------|----------|----------|
//! | [`Mode`]      | `Full`   | `Delta`  |
//! | [`Operation`] | `Upsert` | `Delete` |
//! | [`Status`]    | `Ok`     | `Error`  |

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! wire_enum {
    ($name:ident, $field:literal, $($variant:ident = $value:literal => $text:literal),+ $(,)?) => {
        impl $name {
            /// Returns the wire integer.
            #[must_use]
            pub fn as_u8(self) -> u8 {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// Returns the lowercase name.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(ProtocolError::InvalidValue {
                        field: $field,
                        value: other,
                    }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.as_u8()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Synchronization mode announced in a Start frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mode {
    /// The manager should treat the round as the complete module state.
    Full,
    /// The round carries only changes since the last round.
    Delta,
}

wire_enum!(Mode, "mode", Full = 0 => "full", Delta = 1 => "delta");

/// Kind of change a diff carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Operation {
    /// Full replacement payload for the entity.
    Upsert,
    /// Removal of the entity; the payload carries identity only.
    Delete,
}

wire_enum!(Operation, "operation", Upsert = 0 => "upsert", Delete = 1 => "delete");

/// Outcome reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    /// Request accepted.
    Ok,
    /// Request refused.
    Error,
}

wire_enum!(Status, "status", Ok = 0 => "ok", Error = 1 => "error");
