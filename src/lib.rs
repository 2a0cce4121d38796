//! vibemq-offline - offline message queue and MQTT UTF-8 validator
//!
//! The slice of a multi-core MQTT broker responsible for holding undelivered
//! PUBLISH messages across a client's disconnect and for classifying the
//! UTF-8 text MQTT carries in topics, client identifiers, and properties.

pub mod config;
pub mod protocol;
pub mod session;

pub use config::Config;
pub use protocol::{validate, Properties, PublishOptions, QoS, Utf8Validation};
pub use session::{
    Endpoint, OfflineMessage, OfflineMessageQueue, PublishError, Session, SessionState,
    SessionStore, TimerService,
};
