//! Rust library for ComfoAir ventilation units on the local network
//!
//! This library provides an async client for the ComfoConnect LAN protocol
//! spoken by Zehnder ComfoAir units. It supports:
//!
//! - Discovery of units via UDP broadcast
//! - PIN-authenticated sessions over TCP
//! - Reading and writing typed properties (fan level, operating mode, ...)
//! - Push subscriptions for live sensor values
//! - Keep-alive, watchdog and automatic reconnection with backoff
//!
//! # Quick Start
//!
//! ```no_run
//! use comfoair::{discover, ClientConfig, ComfoControlClient, DiscoveryConfig, FanMode};
//! use comfoair::properties::{FAN_SPEED_SETTING, SUPPLY_AIR_TEMPERATURE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Find units on the local network
//!     let units = discover(&DiscoveryConfig::default()).await?;
//!     let Some(unit) = units.into_iter().next() else {
//!         return Ok(());
//!     };
//!
//!     // Connect with the unit's PIN
//!     let client = ComfoControlClient::new(unit, 0, ClientConfig::default());
//!     client.connect().await?;
//!
//!     let supply = client.read_property(SUPPLY_AIR_TEMPERATURE.id).await?;
//!     println!("Supply air: {}", supply);
//!
//!     // Follow fan level changes
//!     client
//!         .register_property_listener(FAN_SPEED_SETTING.id, |value| {
//!             println!("Fan level is now {}", value.value);
//!         })
//!         .await?;
//!     client.set_fan_mode(FanMode::High).await?;
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Discovery**: UDP probe and reply collection
//! - **Client**: Public facade, one session per unit
//! - **Session**: Authentication, keep-alive, reconnection and push dispatch
//! - **Correlator**: Sequence numbers and request deadlines
//! - **Connection**: Length-prefixed framing over TCP
//! - **Protocol**: Binary frame encoding and decoding
//! - **Properties**: Static registry of known properties

mod client;
mod config;
mod connection;
mod correlator;
mod discovery;
mod error;
pub mod properties;
pub mod protocol;
mod session;
mod state;
mod subscription;
mod types;

// Public exports
pub use client::ComfoControlClient;
pub use config::{ClientConfig, DiscoveryConfig, PendingPolicy, ReconnectConfig};
pub use connection::{encode_frame, Connection, FrameBuffer, Frames, MAX_FRAME_LEN};
pub use discovery::{discover, Discovery};
pub use error::{ComfoError, Result};
pub use session::Session;
pub use state::SessionState;
pub use subscription::{EventReceiver, PropertyCallback, SessionEvent, SubscriptionHandle};
pub use types::{
    FanMode, NodeInfo, OperatingMode, PropertyId, PropertyValue, UnitDescriptor, Value,
    ValueKind, DEFAULT_PORT,
};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
