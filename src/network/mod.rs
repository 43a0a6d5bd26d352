//! Transports carrying `RaftMessage`s between members.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryNetworkConfig};
pub use tcp::{TcpNetwork, TcpNetworkOptions, serve};
