use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use pcap::{Active, Capture, Device};
use thiserror::Error;

use crate::capture::queue::PacketQueue;
use crate::service::stop::StopFlag;

const READ_TIMEOUT_MS: i32 = 200;
const ERROR_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("network interface '{0}' not found. Available interfaces: {1:?}")]
    InterfaceNotFound(String, Vec<String>),

    #[error("failed to open capture on '{0}': {1}")]
    OpenFailed(String, #[source] pcap::Error),

    #[error("device enumeration failed: {0}")]
    DeviceError(#[source] pcap::Error),
}

/// Live capture worker. Opens the interface promiscuous with a sub-second
/// read timeout so the stop flag is observed between polls, and feeds raw
/// frames into the shared bounded queue.
pub struct PacketSniffer {
    capture: Capture<Active>,
    interface: String,
    queue: Arc<PacketQueue>,
}

impl PacketSniffer {
    pub fn open(interface: &str, queue: Arc<PacketQueue>) -> Result<Self, CaptureError> {
        let devices = Device::list().map_err(CaptureError::DeviceError)?;
        if !devices.iter().any(|d| d.name == interface) {
            let names = devices.into_iter().map(|d| d.name).collect();
            return Err(CaptureError::InterfaceNotFound(interface.to_string(), names));
        }

        let capture = Capture::from_device(interface)
            .map_err(|e| CaptureError::OpenFailed(interface.to_string(), e))?
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::OpenFailed(interface.to_string(), e))?;

        Ok(Self {
            capture,
            interface: interface.to_string(),
            queue,
        })
    }

    pub fn run(mut self, stop: &StopFlag) {
        info!("packet capture started on {}", self.interface);
        while !stop.is_set() {
            match self.capture.next_packet() {
                Ok(packet) => self.queue.push(packet.data.to_vec()),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    error!("packet capture error on {}: {}", self.interface, e);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        info!(
            "packet capture stopped on {} ({} frames dropped)",
            self.interface,
            self.queue.dropped_packets()
        );
    }
}
