pub mod clob;
pub mod connection;
pub mod heads;
pub mod messages;

pub use connection::{TransportCommand, TransportEvent, TransportManager};
