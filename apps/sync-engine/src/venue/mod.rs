//! Venue protocol client: wire messages and the WebSocket transport.

pub mod messages;
pub mod transport;

pub use messages::Frame;
pub use transport::{TransportError, VenueReader, VenueSession, VenueWriter};
