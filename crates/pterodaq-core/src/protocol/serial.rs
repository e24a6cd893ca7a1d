//! Serial port handling
//!
//! Port enumeration, opening at the firmware baud rate, and the reset
//! sequence that gets a board out of its bootloader. Some boards (the
//! Leonardo) re-enumerate under a new port name when the bootloader exits,
//! so the reset watches the port list while it waits.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::{HashMap, HashSet};
#[cfg(target_os = "linux")]
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{LinkError, SerialChannel, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};

/// Interval between port-list snapshots while watching for re-enumeration
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Byte that ends the Leonardo bootloader
const BOOTLOADER_EXIT: u8 = b'E';

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: ttyACM* first, then ttyUSB*, each numerically, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev does not always report CDC-ACM boards
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Names of the currently available ports
pub fn port_names() -> Vec<String> {
    list_ports().into_iter().map(|p| p.name).collect()
}

/// Open a serial port at the firmware baud rate
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, LinkError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!("Opening {} at {} baud", name, baud);
    let port = serialport::new(name, baud)
        .timeout(Duration::from_millis(DEFAULT_READ_TIMEOUT_MS))
        .open()?;
    Ok(port)
}

/// Configure a serial port as 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;
    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

/// Background watcher that reports a port appearing in the enumeration.
///
/// Polls the snapshot function every `interval`, comparing against the
/// previous snapshot. Stops on its own once a new port shows up.
pub struct PortWatcher {
    active: Arc<AtomicBool>,
    found: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl PortWatcher {
    /// Watch the system serial port list
    pub fn start() -> Self {
        Self::with_snapshot(port_names, WATCH_INTERVAL)
    }

    /// Watch an arbitrary enumeration source
    pub fn with_snapshot<F>(snapshot: F, interval: Duration) -> Self
    where
        F: Fn() -> Vec<String> + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let found = Arc::new(Mutex::new(None));

        let thread_active = active.clone();
        let thread_found = found.clone();
        let handle = thread::spawn(move || {
            let mut previous: HashSet<String> = snapshot().into_iter().collect();
            while thread_active.load(Ordering::SeqCst) {
                thread::sleep(interval);
                let current: HashSet<String> = snapshot().into_iter().collect();
                if let Some(new_port) = current.difference(&previous).next() {
                    debug!("New port appeared: {}", new_port);
                    if let Ok(mut slot) = thread_found.lock() {
                        *slot = Some(new_port.clone());
                    }
                    thread_active.store(false, Ordering::SeqCst);
                    break;
                }
                previous = current;
            }
        });

        Self {
            active,
            found,
            handle: Some(handle),
        }
    }

    /// The newly appeared port, if any
    pub fn found(&self) -> Option<String> {
        self.found.lock().ok().and_then(|slot| slot.clone())
    }

    /// Whether the watcher is still polling
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop polling and wait for the watcher thread to exit
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a board, ending any bootloader and following a re-enumeration.
///
/// Returns the opened channel and the name of the port actually used.
pub fn reset_and_open(name: &str, baud_rate: Option<u32>) -> Result<(SerialChannel, String), LinkError> {
    let mut watcher = PortWatcher::start();

    let mut port = open_port(name, baud_rate)?;
    thread::sleep(Duration::from_millis(100));
    port.write_all(&[BOOTLOADER_EXIT])?;
    thread::sleep(Duration::from_secs(1));

    match watcher.found() {
        None => {
            watcher.stop();
            thread::sleep(Duration::from_millis(600));
            Ok((SerialChannel::new(port), name.to_string()))
        }
        Some(new_name) => {
            drop(port);
            watcher.stop();
            info!("Board re-enumerated as {}", new_name);
            let mut port = open_port(&new_name, baud_rate)?;
            if let Err(e) = configure_port(port.as_mut()) {
                warn!("Could not configure {}: {}", new_name, e);
            }
            thread::sleep(Duration::from_millis(100));
            Ok((SerialChannel::new(port), new_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_list_ports() {
        // Must not panic on machines without serial hardware
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo::bare(n.to_string()))
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_watcher_finds_new_port() {
        let ports = Arc::new(Mutex::new(vec!["/dev/ttyACM0".to_string()]));
        let source = ports.clone();
        let watcher = PortWatcher::with_snapshot(
            move || source.lock().unwrap().clone(),
            Duration::from_millis(5),
        );

        thread::sleep(Duration::from_millis(20));
        assert_eq!(watcher.found(), None);
        ports.lock().unwrap().push("/dev/ttyACM1".to_string());

        let deadline = Instant::now() + Duration::from_secs(2);
        while watcher.found().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(watcher.found(), Some("/dev/ttyACM1".to_string()));
        assert!(!watcher.is_active());
    }

    #[test]
    fn test_watcher_stop() {
        let mut watcher =
            PortWatcher::with_snapshot(Vec::new, Duration::from_millis(5));
        watcher.stop();
        assert!(!watcher.is_active());
        assert_eq!(watcher.found(), None);
    }
}
