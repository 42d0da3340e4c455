//! Seam to the physical transport layer.
//!
//! The engine never enumerates or opens serial hardware itself; a
//! [`TransportProvider`] hands it named byte streams. Anything that can
//! read and write bytes asynchronously qualifies — a real serial port, a
//! TCP bridge, or an in-memory duplex pipe in tests.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Controllers run their links at 115200 8N1; providers opening real
/// hardware must configure this mode.
pub const BAUD_RATE: u32 = 115_200;

// Nexmosphere controllers ship with Prolific Technology USB bridges.
const PROLIFIC_VID: &str = "067b";
const PROLIFIC_PIDS: [&str; 3] = ["2303", "23a3", "23d3"];

/// A duplex byte channel to one controller.
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Identity of one detected serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Stable name; doubles as the controller name.
    pub name: String,
    pub is_usb: bool,
    /// USB vendor id, lowercase hex.
    pub vendor_id: String,
    /// USB product id, lowercase hex.
    pub product_id: String,
}

/// Supplies serial ports to the service's discovery loop.
///
/// `list_ports` is called on every scan tick; `open` only for ports that
/// match a supported adapter and are not already attached.
pub trait TransportProvider: Send + Sync {
    fn list_ports(&self) -> io::Result<Vec<PortDescriptor>>;

    fn open(&self, port: &PortDescriptor) -> io::Result<Box<dyn SerialLink>>;
}

/// Whether a port looks like a Nexmosphere controller.
///
/// USB only: Prolific VID `067b` with one of the known bridge PIDs.
/// RS-232 ports are never matched.
pub fn is_supported_adapter(port: &PortDescriptor) -> bool {
    port.is_usb
        && port.vendor_id.to_lowercase() == PROLIFIC_VID
        && PROLIFIC_PIDS.contains(&port.product_id.to_lowercase().as_str())
}
