//! Store-and-forward delivery of processed records to the broker

mod message;
#[cfg(feature = "mqtt")]
mod mqtt;
mod publisher;
mod transport;

pub use message::*;
#[cfg(feature = "mqtt")]
pub use mqtt::*;
pub use publisher::*;
pub use transport::*;
