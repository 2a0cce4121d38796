//! MQTT protocol types shared by the offline message queue and the UTF-8 validator.
//!
//! This module carries the slice of the MQTT v5.0 data model the session layer
//! needs: quality of service, the per-PUBLISH option bitfield, and the
//! property set. Wire encoding/decoding of packets, and the bidirectional
//! PUBLISH packet type itself, are transport-layer concerns that live outside
//! this crate — the offline queue stores a topic/payload/options/properties
//! tuple directly (see `OfflineMessage`) rather than a wire packet value.

mod properties;
mod utf8;

pub use properties::Properties;
pub use utf8::{validate, Utf8Validation};

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (consumes a packet identifier)
    AtLeastOnce = 1,
    /// Exactly once delivery (consumes a packet identifier)
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Whether a successful send at this QoS consumes a packet identifier.
    pub fn consumes_packet_id(self) -> bool {
        self != QoS::AtMostOnce
    }
}

/// Per-PUBLISH option bitfield: QoS, retain, and dup.
///
/// `dup` is always false for entries admitted into the offline queue; the
/// endpoint is responsible for setting it again on actual retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl PublishOptions {
    pub fn new(qos: QoS, retain: bool, dup: bool) -> Self {
        Self { qos, retain, dup }
    }
}
