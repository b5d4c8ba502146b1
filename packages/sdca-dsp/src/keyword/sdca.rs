// Downstream SDCA device interface
//
// The keyword detector drives the VAD port on the downstream codec through
// synchronous SDCA property requests. `SimulatedSdcaDevice` stands in for
// the codec: it records every request and can be told to fail or stall.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DspError, Result};
use crate::format::StreamFormat;

/// Timeout applied to every downstream request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Size-query retries tolerated when a property keeps growing.
pub const MAX_PROPERTY_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdcaRequest {
    ConfigureVadPort { format: StreamFormat, port: u32 },
    CleanupVadPort { port: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdcaProperty {
    FunctionDescriptor,
    EntityDescriptor,
}

pub trait SdcaTarget: Send + Sync {
    fn send_request(&self, request: &SdcaRequest, timeout: Duration) -> Result<()>;

    /// Copy `property` into `buffer` and return its length. A short buffer
    /// fails with `BufferTooSmall` or `BufferOverflow` carrying the size
    /// needed.
    fn get_property(
        &self,
        property: SdcaProperty,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}

/// Two-phase property read: query the size, allocate, fetch.
pub fn query_property(
    target: &dyn SdcaTarget,
    property: SdcaProperty,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for _ in 0..=MAX_PROPERTY_RETRIES {
        match target.get_property(property, &mut buffer, timeout) {
            Ok(len) => {
                buffer.truncate(len);
                return Ok(buffer);
            }
            Err(DspError::BufferTooSmall { required }) | Err(DspError::BufferOverflow { required }) => {
                log::debug!("{:?} needs {} bytes", property, required);
                buffer.resize(required, 0);
            }
            Err(e) => return Err(e),
        }
    }
    Err(DspError::DeviceRequest(format!(
        "{:?} size still changing after {} retries",
        property, MAX_PROPERTY_RETRIES
    )))
}

#[derive(Debug)]
struct DeviceState {
    configure_calls: usize,
    cleanup_calls: usize,
    requests: Vec<SdcaRequest>,
    fail_next_configure: bool,
    fail_next_cleanup: bool,
    latency: Duration,
    port_configured: bool,
    function_descriptor: Vec<u8>,
    entity_descriptor: Vec<u8>,
}

/// In-process stand-in for the downstream SDCA codec.
#[derive(Debug)]
pub struct SimulatedSdcaDevice {
    state: Mutex<DeviceState>,
}

impl SimulatedSdcaDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                configure_calls: 0,
                cleanup_calls: 0,
                requests: Vec::new(),
                fail_next_configure: false,
                fail_next_cleanup: false,
                latency: Duration::ZERO,
                port_configured: false,
                function_descriptor: b"SDCA function: SmartMic; VAD ports 1".to_vec(),
                entity_descriptor: b"SDCA entities: IT 11, CS 18, PDE 11, OT 10".to_vec(),
            }),
        }
    }

    pub fn configure_calls(&self) -> usize {
        self.state.lock().configure_calls
    }

    pub fn cleanup_calls(&self) -> usize {
        self.state.lock().cleanup_calls
    }

    pub fn requests(&self) -> Vec<SdcaRequest> {
        self.state.lock().requests.clone()
    }

    pub fn is_port_configured(&self) -> bool {
        self.state.lock().port_configured
    }

    /// Fail the next `ConfigureVadPort` request.
    pub fn fail_next_configure(&self) {
        self.state.lock().fail_next_configure = true;
    }

    /// Fail the next `CleanupVadPort` request.
    pub fn fail_next_cleanup(&self) {
        self.state.lock().fail_next_cleanup = true;
    }

    /// Response delay; requests slower than their timeout fail.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn set_descriptor(&self, property: SdcaProperty, blob: Vec<u8>) {
        let mut state = self.state.lock();
        match property {
            SdcaProperty::FunctionDescriptor => state.function_descriptor = blob,
            SdcaProperty::EntityDescriptor => state.entity_descriptor = blob,
        }
    }

    fn wait_for_response(&self, timeout: Duration) -> Result<()> {
        let latency = self.state.lock().latency;
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(DspError::Timeout(timeout));
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }
}

impl Default for SimulatedSdcaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SdcaTarget for SimulatedSdcaDevice {
    fn send_request(&self, request: &SdcaRequest, timeout: Duration) -> Result<()> {
        self.state.lock().requests.push(request.clone());
        self.wait_for_response(timeout)?;

        let mut state = self.state.lock();
        match request {
            SdcaRequest::ConfigureVadPort { port, .. } => {
                state.configure_calls += 1;
                if std::mem::take(&mut state.fail_next_configure) {
                    return Err(DspError::DeviceRequest(format!(
                        "configure VAD port {} rejected",
                        port
                    )));
                }
                state.port_configured = true;
            }
            SdcaRequest::CleanupVadPort { port } => {
                state.cleanup_calls += 1;
                if std::mem::take(&mut state.fail_next_cleanup) {
                    return Err(DspError::DeviceRequest(format!(
                        "cleanup VAD port {} rejected",
                        port
                    )));
                }
                state.port_configured = false;
            }
        }
        Ok(())
    }

    fn get_property(
        &self,
        property: SdcaProperty,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.wait_for_response(timeout)?;

        let state = self.state.lock();
        let blob = match property {
            SdcaProperty::FunctionDescriptor => &state.function_descriptor,
            SdcaProperty::EntityDescriptor => &state.entity_descriptor,
        };
        if buffer.is_empty() {
            return Err(DspError::BufferOverflow {
                required: blob.len(),
            });
        }
        if buffer.len() < blob.len() {
            return Err(DspError::BufferTooSmall {
                required: blob.len(),
            });
        }
        buffer[..blob.len()].copy_from_slice(blob);
        Ok(blob.len())
    }
}
