use crate::error::{FaultKind, PtzError, TransportError};
use crate::model::ModelStore;
use crate::retry::{CallFailure, TransportCaller};
use crate::transport::TransportOp;
use crate::types::{Ack, Capability, Preset, PtzCommand, PtzVelocity, Support};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{PTZ_CAPABILITY_DEGRADED, PTZ_CAPABILITY_DOWNGRADES, PTZ_COMMANDS};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a transport call ended when it did not surface an error.
enum Delivered<T> {
    Done(T),
    /// Mechanical limit reached; the command itself is supported
    AtLimit,
    /// Stop refused because nothing was moving
    Idle,
}

impl Delivered<()> {
    fn ack(self) -> Ack {
        match self {
            Delivered::AtLimit => Ack::AtLimit,
            Delivered::Done(()) | Delivered::Idle => Ack::Accepted,
        }
    }
}

/// Validates commands against the live capability model and turns them into
/// transport calls.
///
/// Commands are not queued: each dispatch is issued as soon as it arrives and
/// the device keeps whichever motion it received last.
pub struct CommandDispatcher {
    caller: Arc<TransportCaller>,
    store: Arc<ModelStore>,
    degrade_threshold: u32,
    preset_retries: u32,
    failures: Mutex<HashMap<Capability, u32>>,
    degraded_tx: mpsc::UnboundedSender<Capability>,
    motion_epoch: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl CommandDispatcher {
    pub(crate) fn new(
        caller: Arc<TransportCaller>,
        store: Arc<ModelStore>,
        degrade_threshold: u32,
        preset_retries: u32,
        degraded_tx: mpsc::UnboundedSender<Capability>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            caller,
            store,
            degrade_threshold,
            preset_retries,
            failures: Mutex::new(HashMap::new()),
            degraded_tx,
            motion_epoch: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub async fn dispatch(&self, command: PtzCommand) -> Result<Ack, PtzError> {
        let result = self.execute(&command).await;

        let outcome = match &result {
            Ok(Ack::AtLimit) => "at_limit",
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        PTZ_COMMANDS
            .with_label_values(&[command.kind(), outcome])
            .inc();

        if let Err(e) = &result {
            debug!(
                device = %self.caller.device(),
                command = command.kind(),
                error = %e,
                "command not executed"
            );
        }
        result
    }

    async fn execute(&self, command: &PtzCommand) -> Result<Ack, PtzError> {
        // Pin the snapshot for the whole command; a concurrent refresh does
        // not change what this call validated against.
        let model = self.store.current();
        let capability = command.capability();
        if !model.support(capability).permits_attempt() {
            return Err(PtzError::UnsupportedCapability(capability));
        }
        validate(command)?;
        if let PtzCommand::Move {
            duration: Some(_), ..
        }
        | PtzCommand::Zoom {
            duration: Some(_), ..
        } = command
        {
            // A bounded move is only safe if the Stop that ends it can be sent.
            if !model.support(Capability::Stop).permits_attempt() {
                return Err(PtzError::UnsupportedCapability(Capability::Stop));
            }
        }

        let token = model.profile_token();
        let transport = self.caller.transport();

        match command {
            PtzCommand::Move {
                pan,
                tilt,
                duration,
            } => {
                self.motion(capability, PtzVelocity::pan_tilt(*pan, *tilt), *duration, token)
                    .await
            }
            PtzCommand::Zoom { speed, duration } => {
                self.motion(capability, PtzVelocity::zoom(*speed), *duration, token)
                    .await
            }
            PtzCommand::Stop => {
                // Stop supersedes any pending nudge.
                self.motion_epoch.fetch_add(1, Ordering::SeqCst);
                let delivered = self
                    .send(capability, TransportOp::Stop, move || transport.stop(token))
                    .await?;
                Ok(delivered.ack())
            }
            PtzCommand::GotoPreset { id } => {
                if model.preset_by_id(id).is_none() {
                    return Err(PtzError::UnknownPreset(id.clone()));
                }
                let id = id.as_str();
                let delivered = self
                    .send(capability, TransportOp::GotoPreset, move || {
                        transport.goto_preset(token, id)
                    })
                    .await?;
                Ok(delivered.ack())
            }
            PtzCommand::SetPreset { label } => {
                let name = label.as_str();
                match self
                    .send(capability, TransportOp::SetPreset, move || {
                        transport.set_preset(token, name)
                    })
                    .await?
                {
                    Delivered::Done(id) => {
                        let preset = Preset::new(id, label.clone());
                        self.store
                            .update(|m| Some(m.with_preset_saved(preset.clone())));
                        info!(
                            device = %self.caller.device(),
                            preset_id = %preset.id,
                            label = %preset.label,
                            "preset saved"
                        );
                        Ok(Ack::PresetCreated { preset })
                    }
                    Delivered::AtLimit => Ok(Ack::AtLimit),
                    Delivered::Idle => Ok(Ack::Accepted),
                }
            }
            PtzCommand::RemovePreset { id } => {
                if model.preset_by_id(id).is_none() {
                    return Err(PtzError::UnknownPreset(id.clone()));
                }
                let target = id.as_str();
                let delivered = self
                    .send(capability, TransportOp::RemovePreset, move || {
                        transport.remove_preset(token, target)
                    })
                    .await?;
                if let Delivered::Done(()) = delivered {
                    self.store.update(|m| Some(m.with_preset_removed(id)));
                }
                Ok(delivered.ack())
            }
            PtzCommand::GotoHome => {
                let delivered = self
                    .send(capability, TransportOp::GotoHomePosition, move || {
                        transport.goto_home_position(token)
                    })
                    .await?;
                self.confirm_home();
                Ok(delivered.ack())
            }
            PtzCommand::SetHome => {
                let delivered = self
                    .send(capability, TransportOp::SetHomePosition, move || {
                        transport.set_home_position(token)
                    })
                    .await?;
                self.confirm_home();
                Ok(delivered.ack())
            }
        }
    }

    async fn motion(
        &self,
        capability: Capability,
        velocity: PtzVelocity,
        duration: Option<Duration>,
        token: &str,
    ) -> Result<Ack, PtzError> {
        let epoch = self.motion_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = self.caller.transport();
        let delivered = self
            .send(capability, TransportOp::ContinuousMove, || {
                transport.continuous_move(token, &velocity)
            })
            .await?;

        if let (Delivered::Done(()), Some(duration)) = (&delivered, duration) {
            self.schedule_stop(epoch, duration, token.to_string());
        }
        Ok(delivered.ack())
    }

    /// Issue Stop after `duration` unless another motion command or an
    /// explicit Stop came in first.
    fn schedule_stop(&self, epoch: u64, duration: Duration, token: String) {
        if !self.store.current().support(Capability::Stop).permits_attempt() {
            warn!(
                device = %self.caller.device(),
                "stop became unsupported while a nudge was starting, motion is not bounded"
            );
            return;
        }
        let caller = Arc::clone(&self.caller);
        let motion_epoch = Arc::clone(&self.motion_epoch);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(duration) => {}
            }
            if motion_epoch.load(Ordering::SeqCst) != epoch {
                debug!(device = %caller.device(), "nudge superseded, skipping stop");
                return;
            }

            let transport = caller.transport();
            let retries = caller.policy().max_retries;
            match caller
                .call(TransportOp::Stop, retries, || transport.stop(&token))
                .await
            {
                Ok(()) => debug!(device = %caller.device(), "nudge stopped"),
                Err(failure) => warn!(
                    device = %caller.device(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "failed to stop after nudge"
                ),
            }
        });
    }

    /// Re-read the preset listing without a full probe.
    pub async fn reload_presets(&self) -> Result<Vec<Preset>, PtzError> {
        let model = self.store.current();
        let token = model.profile_token();
        let transport = self.caller.transport();

        match self
            .caller
            .call(TransportOp::GetPresets, self.preset_retries, move || {
                transport.get_presets(token)
            })
            .await
        {
            Ok(presets) => {
                self.store
                    .update(|m| Some(m.with_presets(presets.clone())));
                debug!(
                    device = %self.caller.device(),
                    count = presets.len(),
                    "preset listing reloaded"
                );
                Ok(presets)
            }
            Err(failure) => {
                self.store.update(|m| {
                    (m.support(Capability::Presets) != Support::Unsupported)
                        .then(|| m.with_support(Capability::Presets, Support::Unsupported))
                });
                warn!(
                    device = %self.caller.device(),
                    error = %failure.error,
                    "preset reload failed, presets disabled until next refresh"
                );
                if failure.error.is_transient() {
                    Err(PtzError::CommandFailed {
                        capability: Capability::Presets,
                        attempts: failure.attempts,
                    })
                } else {
                    Err(PtzError::UnsupportedCapability(Capability::Presets))
                }
            }
        }
    }

    async fn send<T, F, Fut>(
        &self,
        capability: Capability,
        op: TransportOp,
        call: F,
    ) -> Result<Delivered<T>, PtzError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let retries = self.caller.policy().max_retries;
        let failure = match self.caller.call(op, retries, call).await {
            Ok(value) => {
                self.clear_failures(capability).await;
                return Ok(Delivered::Done(value));
            }
            Err(failure) => failure,
        };

        match failure.error.fault_kind() {
            Some(FaultKind::InvalidPosition) => {
                debug!(
                    device = %self.caller.device(),
                    operation = %op,
                    "device at its limit"
                );
                self.clear_failures(capability).await;
                Ok(Delivered::AtLimit)
            }
            Some(FaultKind::Rejected) if capability == Capability::Stop => {
                debug!(device = %self.caller.device(), "stop refused, nothing in motion");
                self.clear_failures(capability).await;
                Ok(Delivered::Idle)
            }
            Some(kind) if self.fault_downgrades(capability, kind) => {
                Err(self.downgrade(capability, &failure.error))
            }
            _ => Err(self.record_failure(capability, failure).await),
        }
    }

    /// Home has no probe, so any fault before the first success settles it.
    /// Once Home worked, later faults are treated as command failures.
    fn fault_downgrades(&self, capability: Capability, kind: FaultKind) -> bool {
        match capability {
            Capability::Home => {
                self.store.current().support(Capability::Home) != Support::Confirmed
            }
            _ => kind == FaultKind::NotSupported,
        }
    }

    fn downgrade(&self, capability: Capability, error: &TransportError) -> PtzError {
        let changed = self.store.update(|m| {
            (m.support(capability) != Support::Unsupported)
                .then(|| m.with_support(capability, Support::Unsupported))
        });
        if changed {
            PTZ_CAPABILITY_DOWNGRADES
                .with_label_values(&[capability.as_str()])
                .inc();
            warn!(
                device = %self.caller.device(),
                capability = %capability,
                error = %error,
                "device rejected capability, marking unsupported"
            );
        }
        PtzError::UnsupportedCapability(capability)
    }

    async fn record_failure(&self, capability: Capability, failure: CallFailure) -> PtzError {
        let reached = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(capability).or_insert(0);
            *count += 1;
            let reached = *count >= self.degrade_threshold
                && self.store.current().support(capability) == Support::Confirmed;
            if reached {
                *count = 0;
            }
            reached
        };

        if reached {
            PTZ_CAPABILITY_DEGRADED
                .with_label_values(&[capability.as_str()])
                .inc();
            warn!(
                device = %self.caller.device(),
                capability = %capability,
                threshold = self.degrade_threshold,
                "confirmed capability keeps failing, requesting refresh"
            );
            // The receiver is gone only once the session is disposed.
            let _ = self.degraded_tx.send(capability);
        }

        PtzError::CommandFailed {
            capability,
            attempts: failure.attempts,
        }
    }

    async fn clear_failures(&self, capability: Capability) {
        self.failures.lock().await.remove(&capability);
    }

    fn confirm_home(&self) {
        let confirmed = self.store.update(|m| {
            (m.support(Capability::Home) != Support::Confirmed)
                .then(|| m.with_support(Capability::Home, Support::Confirmed))
        });
        if confirmed {
            info!(device = %self.caller.device(), "home position confirmed");
        }
    }
}

fn validate(command: &PtzCommand) -> Result<(), PtzError> {
    match command {
        PtzCommand::Move {
            pan,
            tilt,
            duration,
        } => {
            check_velocity("pan", *pan)?;
            check_velocity("tilt", *tilt)?;
            check_duration(*duration)
        }
        PtzCommand::Zoom { speed, duration } => {
            check_velocity("speed", *speed)?;
            check_duration(*duration)
        }
        PtzCommand::GotoPreset { id } | PtzCommand::RemovePreset { id } => {
            if id.trim().is_empty() {
                return Err(PtzError::invalid("id", "must not be empty"));
            }
            Ok(())
        }
        PtzCommand::SetPreset { label } => {
            if label.trim().is_empty() {
                return Err(PtzError::invalid("label", "must not be empty"));
            }
            Ok(())
        }
        PtzCommand::Stop | PtzCommand::GotoHome | PtzCommand::SetHome => Ok(()),
    }
}

fn check_velocity(field: &'static str, value: f32) -> Result<(), PtzError> {
    if !value.is_finite() {
        return Err(PtzError::invalid(field, "must be a finite number"));
    }
    if !(-1.0..=1.0).contains(&value) {
        return Err(PtzError::invalid(field, "must be within [-1.0, 1.0]"));
    }
    Ok(())
}

fn check_duration(duration: Option<Duration>) -> Result<(), PtzError> {
    match duration {
        Some(d) if d.is_zero() => Err(PtzError::invalid("duration", "must be positive")),
        _ => Ok(()),
    }
}
