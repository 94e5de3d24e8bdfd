//! Closed registry of shippable read-modify-write update kinds.
//!
//! Updates are pure functions over a value's bytes, named by a tagged
//! enum so the serving side resolves them against code compiled into the
//! deployed binary, never against anything carried in the message.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Append raw bytes to the value, creating it when absent.
    Append { bytes: Vec<u8> },
}

impl UpdateKind {
    /// Computes the successor bytes from the current ones. Pure: never
    /// mutates its input, always returns a fresh buffer.
    pub fn apply(&self, current: Option<&Bytes>) -> Bytes {
        match self {
            UpdateKind::Append { bytes } => {
                let mut out = BytesMut::with_capacity(
                    current.map_or(0, |c| c.len()) + bytes.len(),
                );
                if let Some(c) = current {
                    out.extend_from_slice(c);
                }
                out.extend_from_slice(bytes);
                out.freeze()
            }
        }
    }
}
