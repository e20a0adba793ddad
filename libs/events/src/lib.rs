//! Events library for the trading platform message core
//!
//! This library provides the event envelope and the closed event taxonomy
//! shared by every service on the bus, ensuring type safety and a stable
//! wire format across process boundaries.
//!
//! # Modules
//! - `ids`: Unique identifiers (EventId, CorrelationId)
//! - `taxonomy`: Closed event type enumeration, groups, publish priority
//! - `envelope`: The `Event` envelope and its wire serialization
//! - `errors`: Error taxonomy for bus operations

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod taxonomy;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::envelope::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::taxonomy::*;
}
