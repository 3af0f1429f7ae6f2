//! NATS backend for the pipebus message bus.
//!
//! Topics map one-to-one to NATS subjects. Payload content travels as the
//! message body and the remaining payload fields as headers.

/// NATS client connection with optional NKey authentication.
pub mod client;
/// Engine implementation on top of NATS core pub/sub.
pub mod engine;
/// Conversion between payloads and NATS messages.
pub mod message;
