pub mod multiplexer;
pub mod transport;

pub use multiplexer::{ConnectionId, ConnectionMultiplexer};
pub use transport::Transport;
