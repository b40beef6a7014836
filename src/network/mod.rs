//! Socket setup and the device command channel

pub mod control;
pub mod udp;

pub use control::{ControlSender, NoopControlSender, TcpControlSender};
pub use udp::create_udp_socket;
