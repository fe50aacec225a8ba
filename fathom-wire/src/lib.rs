pub mod mock;
pub mod protocol;
mod ssi;
mod transport;

pub use protocol::*;
pub use ssi::{EndpointToken, LocationInfo, ProxyId, Ssi, SsiId};
pub use transport::Transport;
