use crate::error::{FaultKind, PtzError};
use crate::model::CapabilityModel;
use crate::retry::{CallFailure, TransportCaller};
use crate::transport::TransportOp;
use crate::types::{DeclaredCapabilities, MediaProfile, Preset, PtzVelocity, Support};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{PTZ_PROBES, PTZ_PROBE_DURATION};
use tracing::{debug, info, warn};

/// Builds a [`CapabilityModel`] from what the device actually does.
///
/// Declared metadata only seeds the model; every non-destructive feature
/// is exercised with a harmless call and the result of that call wins.
/// Home is never exercised here because GotoHomePosition moves the camera.
pub struct CapabilityProber {
    caller: Arc<TransportCaller>,
    preset_retries: u32,
}

impl CapabilityProber {
    pub(crate) fn new(caller: Arc<TransportCaller>, preset_retries: u32) -> Self {
        Self {
            caller,
            preset_retries,
        }
    }

    /// Probe the device and return a model stamped with `generation`.
    ///
    /// Only an unreachable device or a device without a video profile fails
    /// the probe; any other problem degrades a single flag.
    pub async fn probe(&self, generation: u64) -> Result<CapabilityModel, PtzError> {
        let start = Instant::now();
        let result = self.run(generation).await;
        let elapsed = start.elapsed();

        PTZ_PROBE_DURATION.observe(elapsed.as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        PTZ_PROBES.with_label_values(&[outcome]).inc();

        match &result {
            Ok(model) => info!(
                device = %self.caller.device(),
                generation,
                elapsed_ms = elapsed.as_millis() as u64,
                profile = %model.profile_token(),
                pan_tilt = ?model.move_support,
                zoom = ?model.zoom_support,
                stop = ?model.stop_support,
                presets = ?model.preset_support,
                preset_count = model.presets().len(),
                home = ?model.home_support,
                tolerant = model.is_tolerant(),
                "capability probe finished"
            ),
            Err(e) => warn!(
                device = %self.caller.device(),
                generation,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "capability probe failed"
            ),
        }

        result
    }

    async fn run(&self, generation: u64) -> Result<CapabilityModel, PtzError> {
        let profile = self.select_profile().await?;
        let declared = self.declared_capabilities().await;
        let token = profile.token.as_str();

        let (move_support, stop_support) = self.probe_pan_tilt(token, declared.pan_tilt).await;
        let zoom_support = self.probe_zoom(token, declared.zoom).await;
        let (preset_support, presets) = self.probe_presets(token).await;

        let tolerant = (move_support == Support::Confirmed && !declared.pan_tilt)
            || (zoom_support == Support::Confirmed && !declared.zoom)
            || (preset_support == Support::Confirmed && !declared.presets);
        if tolerant {
            debug!(
                device = %self.caller.device(),
                "device works beyond its declared capabilities, using tolerant mode"
            );
        }

        let mut model = CapabilityModel::new(generation, token);
        model.limits = profile.limits.filter(|limits| !limits.is_empty());
        model.move_support = move_support;
        model.stop_support = stop_support;
        model.zoom_support = zoom_support;
        model.preset_support = preset_support;
        model.presets = presets;
        model.home_support = Support::from_declared(declared.home);
        model.tolerant = tolerant;
        Ok(model)
    }

    async fn select_profile(&self) -> Result<MediaProfile, PtzError> {
        let transport = self.caller.transport();
        let retries = self.caller.policy().max_retries;
        let profiles = match self
            .caller
            .call(TransportOp::GetProfiles, retries, move || {
                transport.get_profiles()
            })
            .await
        {
            Ok(profiles) => profiles,
            Err(failure) if failure.error.is_transient() => {
                return Err(PtzError::DeviceUnreachable(failure.error));
            }
            Err(failure) => {
                warn!(
                    device = %self.caller.device(),
                    error = %failure.error,
                    "device rejected GetProfiles"
                );
                return Err(PtzError::NoUsableProfile);
            }
        };

        profiles
            .into_iter()
            .find(|p| p.has_video_source && !p.token.trim().is_empty())
            .ok_or(PtzError::NoUsableProfile)
    }

    /// Missing or unreadable metadata is the same as metadata that claims
    /// nothing: every flag starts as `Unknown`, never as unsupported.
    async fn declared_capabilities(&self) -> DeclaredCapabilities {
        let transport = self.caller.transport();
        match self
            .caller
            .call(TransportOp::GetCapabilities, 0, move || {
                transport.get_capabilities()
            })
            .await
        {
            Ok(declared) => declared,
            Err(failure) => {
                debug!(
                    device = %self.caller.device(),
                    error = %failure.error,
                    "GetCapabilities failed, treating all capabilities as undeclared"
                );
                DeclaredCapabilities::none()
            }
        }
    }

    async fn probe_pan_tilt(&self, token: &str, declared: bool) -> (Support, Support) {
        let transport = self.caller.transport();
        let still = PtzVelocity::pan_tilt(0.0, 0.0);
        let moved = self
            .caller
            .call(TransportOp::ContinuousMove, 0, || {
                transport.continuous_move(token, &still)
            })
            .await;
        // Stop is checked on its own even when the move was refused.
        let stopped = self
            .caller
            .call(TransportOp::Stop, 0, move || transport.stop(token))
            .await;
        (resolve(moved, declared), resolve_stop(stopped, declared))
    }

    async fn probe_zoom(&self, token: &str, declared: bool) -> Support {
        let transport = self.caller.transport();
        let still = PtzVelocity::zoom(0.0);
        let zoomed = self
            .caller
            .call(TransportOp::ContinuousMove, 0, || {
                transport.continuous_move(token, &still)
            })
            .await;
        resolve(zoomed, declared)
    }

    async fn probe_presets(&self, token: &str) -> (Support, Vec<Preset>) {
        let transport = self.caller.transport();
        match self
            .caller
            .call(TransportOp::GetPresets, self.preset_retries, move || {
                transport.get_presets(token)
            })
            .await
        {
            Ok(presets) => (Support::Confirmed, presets),
            Err(failure) if failure.error.is_transient() => {
                warn!(
                    device = %self.caller.device(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "preset listing unavailable, disabling presets until next refresh"
                );
                (Support::Unsupported, Vec::new())
            }
            Err(failure) => {
                debug!(
                    device = %self.caller.device(),
                    error = %failure.error,
                    "device rejected GetPresets"
                );
                (Support::Unsupported, Vec::new())
            }
        }
    }
}

/// Functional result beats metadata. A transport failure proves nothing, so
/// the declared flag is kept.
fn resolve(outcome: Result<(), CallFailure>, declared: bool) -> Support {
    match outcome {
        Ok(()) => Support::Confirmed,
        Err(failure) => match failure.error.fault_kind() {
            Some(FaultKind::InvalidPosition) => Support::Confirmed,
            Some(FaultKind::NotSupported | FaultKind::Rejected) => Support::Unsupported,
            None => Support::from_declared(declared),
        },
    }
}

/// The camera is idle when Stop is probed, so a device that refuses to stop
/// an idle head still implements Stop.
fn resolve_stop(outcome: Result<(), CallFailure>, declared: bool) -> Support {
    match outcome {
        Err(failure) if failure.error.fault_kind() == Some(FaultKind::Rejected) => {
            Support::Confirmed
        }
        outcome => resolve(outcome, declared),
    }
}
