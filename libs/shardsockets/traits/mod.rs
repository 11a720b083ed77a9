pub mod error;
pub mod events;

pub use error::{GatewayError, Result};
pub use events::{EventHandler, IdentifyGate, NoPresence, NoopGate, NoopHandler, PresenceProvider};
