use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A controllable feature of a PTZ device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Move,
    Zoom,
    Stop,
    Presets,
    Home,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Move => "move",
            Capability::Zoom => "zoom",
            Capability::Stop => "stop",
            Capability::Presets => "presets",
            Capability::Home => "home",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved support for one capability.
///
/// Declared metadata is advisory: `Declared` only records that the device
/// claims the feature. `Confirmed` means a real call succeeded and always
/// wins over what the metadata says. `Unsupported` comes from the device
/// rejecting the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Support {
    #[default]
    Unknown,
    Declared,
    Confirmed,
    Unsupported,
}

impl Support {
    /// Whether a command for this capability may be sent to the device.
    pub fn permits_attempt(&self) -> bool {
        !matches!(self, Support::Unsupported)
    }

    /// Whether hosts should show controls for this capability.
    pub fn is_exposed(&self) -> bool {
        matches!(self, Support::Declared | Support::Confirmed)
    }

    pub(crate) fn from_declared(declared: bool) -> Self {
        if declared {
            Support::Declared
        } else {
            Support::Unknown
        }
    }
}

/// Pan/tilt/zoom ranges advertised by a profile's PTZ configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PtzLimits {
    pub pan_min: Option<f32>,
    pub pan_max: Option<f32>,
    pub tilt_min: Option<f32>,
    pub tilt_max: Option<f32>,
    pub zoom_min: Option<f32>,
    pub zoom_max: Option<f32>,
}

impl PtzLimits {
    pub fn is_empty(&self) -> bool {
        [
            self.pan_min,
            self.pan_max,
            self.tilt_min,
            self.tilt_max,
            self.zoom_min,
            self.zoom_max,
        ]
        .iter()
        .all(Option::is_none)
    }
}

/// Media profile as reported by GetProfiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProfile {
    pub token: String,
    pub name: Option<String>,
    pub has_video_source: bool,
    #[serde(default)]
    pub limits: Option<PtzLimits>,
}

impl MediaProfile {
    pub fn video(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: None,
            has_video_source: true,
            limits: None,
        }
    }

    pub fn audio_only(token: impl Into<String>) -> Self {
        Self {
            has_video_source: false,
            ..Self::video(token)
        }
    }
}

/// Capability flags from the device's self-description. Absent and `false`
/// carry the same meaning: the device did not claim the feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredCapabilities {
    pub pan_tilt: bool,
    pub zoom: bool,
    pub presets: bool,
    pub home: bool,
}

impl DeclaredCapabilities {
    pub fn full() -> Self {
        Self {
            pan_tilt: true,
            zoom: true,
            presets: true,
            home: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// A device-stored position. Identity is `id`; labels may collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub label: String,
}

impl Preset {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Normalized ContinuousMove velocity. An axis group left as `None` is
/// omitted from the request, so a zoom-only call never touches pan/tilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PtzVelocity {
    pub pan_tilt: Option<(f32, f32)>,
    pub zoom: Option<f32>,
}

impl PtzVelocity {
    pub fn pan_tilt(pan: f32, tilt: f32) -> Self {
        Self {
            pan_tilt: Some((pan, tilt)),
            zoom: None,
        }
    }

    pub fn zoom(speed: f32) -> Self {
        Self {
            pan_tilt: None,
            zoom: Some(speed),
        }
    }
}

/// One control request. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PtzCommand {
    /// Continuous pan/tilt. With `duration` set, a Stop follows unless a
    /// newer motion command arrives first.
    Move {
        pan: f32,
        tilt: f32,
        #[serde(default, with = "duration_ms")]
        duration: Option<Duration>,
    },
    Zoom {
        speed: f32,
        #[serde(default, with = "duration_ms")]
        duration: Option<Duration>,
    },
    Stop,
    GotoPreset {
        id: String,
    },
    SetPreset {
        label: String,
    },
    RemovePreset {
        id: String,
    },
    GotoHome,
    SetHome,
}

impl PtzCommand {
    pub fn move_by(pan: f32, tilt: f32) -> Self {
        PtzCommand::Move {
            pan,
            tilt,
            duration: None,
        }
    }

    pub fn zoom_by(speed: f32) -> Self {
        PtzCommand::Zoom {
            speed,
            duration: None,
        }
    }

    pub fn goto_preset(id: impl Into<String>) -> Self {
        PtzCommand::GotoPreset { id: id.into() }
    }

    pub fn set_preset(label: impl Into<String>) -> Self {
        PtzCommand::SetPreset {
            label: label.into(),
        }
    }

    pub fn remove_preset(id: impl Into<String>) -> Self {
        PtzCommand::RemovePreset { id: id.into() }
    }

    /// The capability that must not be `Unsupported` for this command.
    pub fn capability(&self) -> Capability {
        match self {
            PtzCommand::Move { .. } => Capability::Move,
            PtzCommand::Zoom { .. } => Capability::Zoom,
            PtzCommand::Stop => Capability::Stop,
            PtzCommand::GotoPreset { .. }
            | PtzCommand::SetPreset { .. }
            | PtzCommand::RemovePreset { .. } => Capability::Presets,
            PtzCommand::GotoHome | PtzCommand::SetHome => Capability::Home,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PtzCommand::Move { .. } => "move",
            PtzCommand::Zoom { .. } => "zoom",
            PtzCommand::Stop => "stop",
            PtzCommand::GotoPreset { .. } => "goto_preset",
            PtzCommand::SetPreset { .. } => "set_preset",
            PtzCommand::RemovePreset { .. } => "remove_preset",
            PtzCommand::GotoHome => "goto_home",
            PtzCommand::SetHome => "set_home",
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, PtzCommand::Move { .. } | PtzCommand::Zoom { .. })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Successful command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum Ack {
    Accepted,
    /// The device refused to move past a mechanical limit. Not an error.
    AtLimit,
    PresetCreated { preset: Preset },
}

/// What a host needs to enable or disable its controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub can_move: bool,
    pub can_zoom: bool,
    pub can_use_home: bool,
    pub preset_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "capability", rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Probing,
    Ready,
    /// A confirmed capability failed repeatedly; a background refresh is due.
    Degraded(Capability),
    Refreshing,
    Disposed,
}

/// Connection details for one physical device. Credentials are opaque to
/// the engine and only handed to the transport connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRef {
    pub name: String,
    pub address: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl DeviceRef {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-session counters for host diagnostics pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDiagnostics {
    pub device: String,
    pub state: SessionState,
    pub generation: u64,
    pub probed_at: DateTime<Utc>,
    pub profile_token: String,
    /// A capability works although the metadata never declared it
    pub tolerant_mode: bool,
    pub transport_retries: u64,
    pub transport_resets: u64,
}
