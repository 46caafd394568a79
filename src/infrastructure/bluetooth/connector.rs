//! Connector Module
//!
//! Abstracts how a serial link to a paired device is found and opened, so
//! the connection manager can run on any platform backend (or a test double).

use crate::infrastructure::bluetooth::protocol::SPP_SERVICE_UUID;
use std::any::Any;
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no paired device named {0:?}")]
    DeviceNotFound(String),
    #[error("{0}")]
    Connect(String),
    #[error("primary connect failed ({primary}); fallback failed ({fallback})")]
    ConnectFailed {
        primary: Box<LinkError>,
        fallback: Box<LinkError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(unix)]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

/// A device previously paired with this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub name: String,
    /// Backend-specific identifier (Bluetooth address or device id)
    pub address: String,
}

/// Which connect method to use. Backends try `Primary` first (the serial
/// port service record) and fall back to `Fallback` when it fails against
/// firmware with a broken or stale service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStrategy {
    Primary,
    Fallback,
}

pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open serial link: its two stream halves plus whatever platform object
/// must stay alive for them to work. Dropping `socket` closes the link.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
    pub socket: Option<Box<dyn Any + Send>>,
}

impl Link {
    pub fn new(reader: LinkReader, writer: LinkWriter) -> Self {
        Self {
            reader,
            writer,
            socket: None,
        }
    }

    pub fn with_socket(mut self, socket: impl Any + Send) -> Self {
        self.socket = Some(Box::new(socket));
        self
    }
}

/// Platform backend able to list paired devices and open RFCOMM links
pub trait Connector: Send + Sync + 'static {
    fn paired_devices(&self) -> impl Future<Output = Result<Vec<PairedDevice>, LinkError>> + Send;

    fn connect(
        &self,
        device: &PairedDevice,
        strategy: ConnectStrategy,
    ) -> impl Future<Output = Result<Link, LinkError>> + Send;
}

/// Pick the paired device whose name matches exactly
pub fn select_device<'a>(devices: &'a [PairedDevice], name: &str) -> Option<&'a PairedDevice> {
    devices.iter().find(|device| device.name == name)
}

/// Discover the target device and connect to it, trying the fallback
/// strategy once if the primary one fails
pub async fn open_link<C: Connector>(connector: &C, device_name: &str) -> Result<Link, LinkError> {
    let devices = connector.paired_devices().await?;
    let device = select_device(&devices, device_name)
        .ok_or_else(|| LinkError::DeviceNotFound(device_name.to_string()))?;

    info!(
        "Connecting to {} ({}) via service {}",
        device.name, device.address, SPP_SERVICE_UUID
    );

    match connector.connect(device, ConnectStrategy::Primary).await {
        Ok(link) => Ok(link),
        Err(primary) => {
            warn!("Using fallback socket connection: {}", primary);
            connector
                .connect(device, ConnectStrategy::Fallback)
                .await
                .map_err(|fallback| LinkError::ConnectFailed {
                    primary: Box::new(primary),
                    fallback: Box::new(fallback),
                })
        }
    }
}
