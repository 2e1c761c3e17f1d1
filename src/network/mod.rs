//! Network subsystem for UDP block transport

pub mod udp;

pub use udp::{bind_data_socket, BlockSender, SenderStats};
