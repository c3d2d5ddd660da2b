//! Client side of the realtime gateway: a WebSocket connection that
//! reconnects by itself and re-joins the rooms it was in.

pub mod backoff;
pub mod client;
pub mod error;
pub mod subscription;
pub mod typing;

pub use backoff::ReconnectPolicy;
pub use client::{ClientConfig, ConnectionState, GatewayClient};
pub use error::ClientError;
pub use subscription::Subscription;
pub use typing::{TypingEvent, TypingTracker};
