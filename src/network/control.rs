//! Fire-and-forget delivery of start/stop commands to the device

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::constants::UNCONFIGURED_DEVICE_IP;
use crate::error::NetworkError;
use crate::protocol::ControlCommand;

pub trait ControlSender: Send + Sync {
    fn send(&self, command: &ControlCommand) -> Result<(), NetworkError>;

    /// False when there is no device to talk to
    fn is_configured(&self) -> bool {
        true
    }
}

/// Opens one TCP connection per command to the device's command port
pub struct TcpControlSender {
    device_address: String,
    port: u16,
    timeout: Duration,
}

impl TcpControlSender {
    pub fn new(device_address: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            device_address: device_address.into(),
            port,
            timeout,
        }
    }

    /// No device configured; commands are skipped
    pub fn is_unconfigured(&self) -> bool {
        self.device_address.is_empty() || self.device_address == UNCONFIGURED_DEVICE_IP
    }
}

impl ControlSender for TcpControlSender {
    fn send(&self, command: &ControlCommand) -> Result<(), NetworkError> {
        if self.is_unconfigured() {
            debug!("No device address configured, skipping {:?}", command);
            return Ok(());
        }

        let addr: SocketAddr = format!("{}:{}", self.device_address, self.port)
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(self.device_address.clone()))?;
        let bytes = command.encode()?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        stream
            .write_all(&bytes)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        info!("Sent {} {} command to {}", command.stream(), command_name(command), addr);
        Ok(())
    }

    fn is_configured(&self) -> bool {
        !self.is_unconfigured()
    }
}

fn command_name(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::Start { .. } => "start",
        ControlCommand::Stop { .. } => "stop",
    }
}

/// Records commands instead of sending them
#[derive(Clone)]
pub struct NoopControlSender {
    sent: Arc<Mutex<Vec<ControlCommand>>>,
    configured: bool,
}

impl Default for NoopControlSender {
    fn default() -> Self {
        Self {
            sent: Arc::default(),
            configured: true,
        }
    }
}

impl NoopControlSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a sender without a device address
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<ControlCommand> {
        self.sent.lock().clone()
    }
}

impl ControlSender for NoopControlSender {
    fn send(&self, command: &ControlCommand) -> Result<(), NetworkError> {
        self.sent.lock().push(command.clone());
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}
