pub mod connection;
pub mod discovery;
pub mod wire;

pub use connection::{ConnId, Connection};
pub use wire::Message;
