//! BlueZ RFCOMM Backend
//!
//! Linux backend. Paired devices are read from the BlueZ device store
//! (`<storage>/<adapter>/<device>/info`). Links are RFCOMM TTY nodes created
//! with `rfcomm bind`; their sysfs attributes tell which device address and
//! channel a node is bound to.
//!
//! Nodes are opened as raw serial ports and bridged onto tokio streams by
//! two pump threads, one per direction.

use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::connector::{
    ConnectStrategy, Connector, Link, LinkError, PairedDevice,
};
use crate::infrastructure::bluetooth::protocol::FALLBACK_RFCOMM_CHANNEL;
use serialport::TTYPort;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, info};

const TTY_CLASS_DIR: &str = "/sys/class/tty";
const BRIDGE_BUFFER: usize = 4096;
/// Bounds how long closing a link waits for the input pump
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct BlueZConnector {
    storage_dir: PathBuf,
    rfcomm_device: PathBuf,
    tty_class_dir: PathBuf,
    baud_rate: u32,
}

impl BlueZConnector {
    pub fn new(settings: &LinkSettings) -> Self {
        Self {
            storage_dir: PathBuf::from(&settings.bluez_storage_dir),
            rfcomm_device: PathBuf::from(&settings.rfcomm_device),
            tty_class_dir: PathBuf::from(TTY_CLASS_DIR),
            baud_rate: settings.baud_rate,
        }
    }

    pub fn with_tty_class_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tty_class_dir = dir.into();
        self
    }

    /// Refuse the configured node if sysfs says it is bound to another device
    async fn check_binding(&self, device: &PairedDevice) -> Result<(), LinkError> {
        let Some(node) = self.rfcomm_device.file_name() else {
            return Ok(());
        };
        let attr = self.tty_class_dir.join(node).join("address");
        match fs::read_to_string(&attr).await {
            Ok(bound) if !bound.trim().eq_ignore_ascii_case(&device.address) => {
                Err(LinkError::Connect(format!(
                    "{} is bound to {}, not {}",
                    self.rfcomm_device.display(),
                    bound.trim(),
                    device.address
                )))
            }
            // Unreadable attributes mean a node we cannot inspect; try it anyway
            _ => Ok(()),
        }
    }

    /// Find the RFCOMM node bound to `device` on `channel`
    async fn find_node(&self, device: &PairedDevice, channel: u8) -> Result<PathBuf, LinkError> {
        let mut entries = fs::read_dir(&self.tty_class_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("rfcomm") {
                continue;
            }

            let address = fs::read_to_string(entry.path().join("address")).await;
            let bound_channel = fs::read_to_string(entry.path().join("channel")).await;
            if let (Ok(address), Ok(bound_channel)) = (address, bound_channel) {
                if address.trim().eq_ignore_ascii_case(&device.address)
                    && bound_channel.trim().parse::<u8>().ok() == Some(channel)
                {
                    return Ok(self.dev_dir().join(name));
                }
            }
        }

        Err(LinkError::Connect(format!(
            "no RFCOMM node bound to {} on channel {}",
            device.address, channel
        )))
    }

    fn dev_dir(&self) -> &Path {
        self.rfcomm_device
            .parent()
            .unwrap_or_else(|| Path::new("/dev"))
    }
}

impl Connector for BlueZConnector {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>, LinkError> {
        let mut devices = Vec::new();
        let mut adapters = fs::read_dir(&self.storage_dir).await?;

        while let Some(adapter) = adapters.next_entry().await? {
            // Adapter directories also hold plain files such as `settings`
            let Ok(mut entries) = fs::read_dir(adapter.path()).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let address = entry.file_name().to_string_lossy().into_owned();
                if !is_bluetooth_address(&address) {
                    continue;
                }
                let Ok(info) = fs::read_to_string(entry.path().join("info")).await else {
                    continue;
                };
                if let Some(device) = parse_device_info(&address, &info) {
                    devices.push(device);
                }
            }
        }

        debug!("Found {} paired devices", devices.len());
        Ok(devices)
    }

    async fn connect(
        &self,
        device: &PairedDevice,
        strategy: ConnectStrategy,
    ) -> Result<Link, LinkError> {
        let node = match strategy {
            ConnectStrategy::Primary => {
                self.check_binding(device).await?;
                self.rfcomm_device.clone()
            }
            ConnectStrategy::Fallback => self.find_node(device, FALLBACK_RFCOMM_CHANNEL).await?,
        };
        // Opening a bound node brings up the RFCOMM connection, which blocks
        let baud_rate = self.baud_rate;
        tokio::task::spawn_blocking(move || open_node(&node, baud_rate))
            .await
            .map_err(|e| LinkError::Connect(format!("open worker failed: {}", e)))?
    }
}

/// Open `path` as a raw serial port: no echo and no newline translation
fn open_node(path: &Path, baud_rate: u32) -> Result<Link, LinkError> {
    let mut port = serialport::new(path.to_string_lossy(), baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(READ_TIMEOUT)
        .open_native()?;
    // The output pump may hold its handle briefly after a close; a reopen
    // must not fail on it
    port.set_exclusive(false)?;
    let input = port.try_clone_native()?;

    let running = Arc::new(AtomicBool::new(true));
    let (inbound, inbound_pump) = tokio::io::duplex(BRIDGE_BUFFER);
    let (outbound, outbound_pump) = tokio::io::duplex(BRIDGE_BUFFER);
    let runtime = Handle::current();

    let input_pump = {
        let running = Arc::clone(&running);
        let runtime = runtime.clone();
        std::thread::spawn(move || pump_input(input, inbound_pump, running, runtime))
    };
    {
        let running = Arc::clone(&running);
        std::thread::spawn(move || pump_output(port, outbound_pump, running, runtime));
    }

    info!("Opened {}", path.display());
    let guard = PortGuard {
        running,
        input_pump: Some(input_pump),
    };
    Ok(Link::new(Box::new(inbound), Box::new(outbound)).with_socket(guard))
}

/// Stops both pumps when the link is dropped
struct PortGuard {
    running: Arc<AtomicBool>,
    input_pump: Option<JoinHandle<()>>,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Once joined the node is no longer read, so a link reopened on it
        // sees every byte
        if let Some(pump) = self.input_pump.take() {
            let _ = pump.join();
        }
    }
}

fn pump_input(mut port: TTYPort, mut pump: DuplexStream, running: Arc<AtomicBool>, runtime: Handle) {
    let mut buf = [0u8; 256];
    while running.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if runtime.block_on(pump.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                debug!("RFCOMM read failed: {}", e);
                break;
            }
        }
    }
    debug!("RFCOMM input pump stopped");
}

fn pump_output(mut port: TTYPort, mut pump: DuplexStream, running: Arc<AtomicBool>, runtime: Handle) {
    let mut buf = [0u8; 256];
    loop {
        let n = match runtime.block_on(pump.read(&mut buf)) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = port.write_all(&buf[..n]).and_then(|()| port.flush()) {
            debug!("RFCOMM write failed: {}", e);
            break;
        }
    }
    debug!("RFCOMM output pump stopped");
}

/// Parse a BlueZ `info` file. Only bonded devices (those with a link key)
/// that have a name are returned.
pub fn parse_device_info(address: &str, info: &str) -> Option<PairedDevice> {
    let mut section = "";
    let mut name = None;
    let mut bonded = false;

    for line in info.lines().map(str::trim) {
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = header;
            bonded |= header == "LinkKey";
        } else if section == "General" {
            if let Some(value) = line.strip_prefix("Name=") {
                name = Some(value.to_string());
            }
        }
    }

    match name {
        Some(name) if bonded => Some(PairedDevice {
            name,
            address: address.to_string(),
        }),
        _ => None,
    }
}

fn is_bluetooth_address(text: &str) -> bool {
    let parts: Vec<&str> = text.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}
