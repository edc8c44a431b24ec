use crate::error::{TransportError, TransportResult};
use crate::types::{DeclaredCapabilities, DeviceRef, MediaProfile, Preset, PtzVelocity};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Typed device-control operations provided by the host's protocol client.
///
/// Each method performs exactly one remote exchange. Implementations report
/// an explicit device rejection as [`TransportError::Fault`] and everything
/// else (timeouts, dropped connections) as a transient variant. Timeouts are
/// also enforced by the engine, so an implementation may block.
#[async_trait]
pub trait PtzTransport: Send + Sync {
    async fn get_profiles(&self) -> TransportResult<Vec<MediaProfile>>;

    /// Best-effort; failures are tolerated by the probe.
    async fn get_capabilities(&self) -> TransportResult<DeclaredCapabilities>;

    async fn continuous_move(&self, profile_token: &str, velocity: &PtzVelocity)
        -> TransportResult<()>;

    async fn stop(&self, profile_token: &str) -> TransportResult<()>;

    async fn get_presets(&self, profile_token: &str) -> TransportResult<Vec<Preset>>;

    /// Returns the device-assigned token of the new preset.
    async fn set_preset(&self, profile_token: &str, label: &str) -> TransportResult<String>;

    async fn goto_preset(&self, profile_token: &str, preset_id: &str) -> TransportResult<()>;

    async fn remove_preset(&self, profile_token: &str, preset_id: &str) -> TransportResult<()>;

    async fn goto_home_position(&self, profile_token: &str) -> TransportResult<()>;

    async fn set_home_position(&self, profile_token: &str) -> TransportResult<()>;

    /// Re-establish the underlying connection after it was dropped.
    async fn reset(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Release the underlying connection. Called once on dispose.
    async fn close(&self) {}
}

/// Transport operation names, used for logs, metrics and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    GetProfiles,
    GetCapabilities,
    ContinuousMove,
    Stop,
    GetPresets,
    SetPreset,
    GotoPreset,
    RemovePreset,
    GotoHomePosition,
    SetHomePosition,
}

impl TransportOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportOp::GetProfiles => "GetProfiles",
            TransportOp::GetCapabilities => "GetCapabilities",
            TransportOp::ContinuousMove => "ContinuousMove",
            TransportOp::Stop => "Stop",
            TransportOp::GetPresets => "GetPresets",
            TransportOp::SetPreset => "SetPreset",
            TransportOp::GotoPreset => "GotoPreset",
            TransportOp::RemovePreset => "RemovePreset",
            TransportOp::GotoHomePosition => "GotoHomePosition",
            TransportOp::SetHomePosition => "SetHomePosition",
        }
    }
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates a transport for a device. Supplied by the host.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, device: &DeviceRef) -> Result<Arc<dyn PtzTransport>, TransportError>;
}

#[async_trait]
impl<F> TransportConnector for F
where
    F: Fn(&DeviceRef) -> Result<Arc<dyn PtzTransport>, TransportError> + Send + Sync,
{
    async fn open(&self, device: &DeviceRef) -> Result<Arc<dyn PtzTransport>, TransportError> {
        self(device)
    }
}
