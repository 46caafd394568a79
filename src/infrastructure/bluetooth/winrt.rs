//! WinRT RFCOMM Backend
//!
//! Windows backend. Paired devices come from the device enumeration API and
//! links are `StreamSocket`s to the device's serial port service. The
//! primary strategy resolves the service from the cached SDP records; the
//! fallback forces a fresh SDP query, which recovers boards whose cached
//! record is stale.
//!
//! WinRT calls block on their async operations inside `spawn_blocking`.
//! An open socket is bridged onto tokio streams by two pump threads.

use crate::infrastructure::bluetooth::connector::{
    ConnectStrategy, Connector, Link, LinkError, PairedDevice,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, info};
use windows::core::{Interface, HSTRING};
use windows::Devices::Bluetooth::Rfcomm::RfcommServiceId;
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothDevice};
use windows::Devices::Enumeration::DeviceInformation;
use windows::Networking::Sockets::StreamSocket;
use windows::Storage::Streams::{DataReader, DataWriter, InputStreamOptions};
use windows_future::IAsyncOperation;

const BRIDGE_BUFFER: usize = 4096;
const READ_CHUNK: u32 = 256;

#[derive(Debug, Default)]
pub struct WinRfcommConnector;

impl WinRfcommConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WinRfcommConnector {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>, LinkError> {
        run_blocking(list_paired_devices).await
    }

    async fn connect(
        &self,
        device: &PairedDevice,
        strategy: ConnectStrategy,
    ) -> Result<Link, LinkError> {
        let device_id = device.address.clone();
        let cache_mode = match strategy {
            ConnectStrategy::Primary => BluetoothCacheMode::Cached,
            ConnectStrategy::Fallback => BluetoothCacheMode::Uncached,
        };
        let socket = run_blocking(move || open_socket(&device_id, cache_mode)).await?;
        bridge(socket)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, LinkError>
where
    F: FnOnce() -> Result<T, LinkError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LinkError::Connect(format!("Bluetooth worker failed: {}", e)))?
}

fn list_paired_devices() -> Result<Vec<PairedDevice>, LinkError> {
    let selector = BluetoothDevice::GetDeviceSelectorFromPairingState(true)?;
    let infos = DeviceInformation::FindAllAsyncAqsFilter(&selector)?.get()?;

    let mut devices = Vec::new();
    for i in 0..infos.Size()? {
        let info = infos.GetAt(i)?;
        devices.push(PairedDevice {
            name: info.Name()?.to_string(),
            address: info.Id()?.to_string(),
        });
    }
    debug!("Found {} paired devices", devices.len());
    Ok(devices)
}

fn open_socket(device_id: &str, cache_mode: BluetoothCacheMode) -> Result<StreamSocket, LinkError> {
    let device = BluetoothDevice::FromIdAsync(&HSTRING::from(device_id))?.get()?;
    let service_id = RfcommServiceId::SerialPort()?;
    let result = device
        .GetRfcommServicesForIdWithCacheModeAsync(&service_id, cache_mode)?
        .get()?;

    let services = result.Services()?;
    if services.Size()? == 0 {
        return Err(LinkError::Connect(format!(
            "serial port service not found ({:?})",
            result.Error()?
        )));
    }
    let service = services.GetAt(0)?;

    let socket = StreamSocket::new()?;
    socket
        .ConnectAsync(&service.ConnectionHostName()?, &service.ConnectionServiceName()?)?
        .get()?;
    info!("RFCOMM socket connected to {}", device.Name()?);
    Ok(socket)
}

/// Closes the socket when the link is dropped, which also ends both pumps
struct SocketGuard(StreamSocket);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = self.0.Close();
    }
}

fn bridge(socket: StreamSocket) -> Result<Link, LinkError> {
    let input = DataReader::CreateDataReader(&socket.InputStream()?)?;
    input.SetInputStreamOptions(InputStreamOptions::Partial)?;
    let output = DataWriter::CreateDataWriter(&socket.OutputStream()?)?;

    let (inbound, inbound_pump) = tokio::io::duplex(BRIDGE_BUFFER);
    let (outbound, outbound_pump) = tokio::io::duplex(BRIDGE_BUFFER);

    let runtime = Handle::current();
    let input_runtime = runtime.clone();
    std::thread::spawn(move || pump_input(input, inbound_pump, input_runtime));
    std::thread::spawn(move || pump_output(output, outbound_pump, runtime));

    Ok(Link::new(Box::new(inbound), Box::new(outbound)).with_socket(SocketGuard(socket)))
}

fn pump_input(input: DataReader, mut pump: DuplexStream, runtime: Handle) {
    loop {
        let loaded = match load(&input) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut buf = vec![0u8; loaded as usize];
        if input.ReadBytes(&mut buf).is_err() {
            break;
        }
        if runtime.block_on(pump.write_all(&buf)).is_err() {
            break;
        }
    }
    debug!("RFCOMM input pump stopped");
}

fn pump_output(output: DataWriter, mut pump: DuplexStream, runtime: Handle) {
    let mut buf = [0u8; 256];
    loop {
        let n = match runtime.block_on(pump.read(&mut buf)) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if output.WriteBytes(&buf[..n]).is_err() || store(&output).is_err() {
            break;
        }
    }
    debug!("RFCOMM output pump stopped");
}

fn load(input: &DataReader) -> windows::core::Result<u32> {
    input
        .LoadAsync(READ_CHUNK)?
        .cast::<IAsyncOperation<u32>>()?
        .get()
}

fn store(output: &DataWriter) -> windows::core::Result<u32> {
    output.StoreAsync()?.cast::<IAsyncOperation<u32>>()?.get()
}
