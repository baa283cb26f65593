//! Core data types: wire envelope, channel names, domain events, and the
//! normalized entities handed to observers.

pub mod entities;
pub mod enums;
pub mod events;
pub mod protocol;

pub use entities::*;
pub use enums::*;
pub use events::*;
pub use protocol::*;
