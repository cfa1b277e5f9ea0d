//! Production bus implementation over the MQTT v5 transport
//!
//! Queue groups map onto shared subscriptions, the reply subject rides the
//! response-topic property, and headers ride user properties, so the
//! request/reply and middleware layers above stay transport-agnostic.

mod client;
mod options;

pub use client::BrokerClient;
