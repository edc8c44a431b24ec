use crate::error::{TransportError, TransportResult};
use crate::transport::{PtzTransport, TransportOp};
use crate::types::{DeclaredCapabilities, MediaProfile, Preset, PtzVelocity};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// One call observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub op: TransportOp,
    pub profile_token: Option<String>,
    /// Preset id or label, depending on the operation
    pub argument: Option<String>,
    pub velocity: Option<PtzVelocity>,
}

/// Scriptable in-memory device for tests and host-side simulation.
///
/// Every operation succeeds by default. Failures can be injected once
/// ([`MockTransport::fail_next`]) or until cleared
/// ([`MockTransport::fail_always`]). All calls are recorded in order.
pub struct MockTransport {
    profiles: Mutex<Vec<MediaProfile>>,
    declared: Mutex<Option<DeclaredCapabilities>>,
    presets: Mutex<Vec<Preset>>,
    next_preset_id: AtomicU64,
    one_shot: Mutex<HashMap<TransportOp, VecDeque<TransportError>>>,
    persistent: Mutex<HashMap<TransportOp, TransportError>>,
    latency: Mutex<HashMap<TransportOp, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    resets: AtomicU32,
    closed: AtomicBool,
}

impl MockTransport {
    /// A device with one video profile (`profile_1`), no declared
    /// capabilities and no presets.
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(vec![MediaProfile::video("profile_1")]),
            declared: Mutex::new(Some(DeclaredCapabilities::none())),
            presets: Mutex::new(Vec::new()),
            next_preset_id: AtomicU64::new(1),
            one_shot: Mutex::new(HashMap::new()),
            persistent: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            resets: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<MediaProfile>) -> Self {
        *self.profiles.get_mut() = profiles;
        self
    }

    /// `None` makes GetCapabilities fail at transport level.
    pub fn with_declared(mut self, declared: Option<DeclaredCapabilities>) -> Self {
        *self.declared.get_mut() = declared;
        self
    }

    pub fn with_presets(mut self, presets: Vec<Preset>) -> Self {
        *self.presets.get_mut() = presets;
        self
    }

    /// Tokens handed out by SetPreset are `tok-<n>`, starting at `next`.
    pub fn with_next_preset_id(self, next: u64) -> Self {
        self.next_preset_id.store(next, Ordering::SeqCst);
        self
    }

    pub async fn fail_next(&self, op: TransportOp, error: TransportError) {
        self.one_shot
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub async fn fail_always(&self, op: TransportOp, error: TransportError) {
        self.persistent.lock().await.insert(op, error);
    }

    pub async fn clear_failures(&self, op: TransportOp) {
        self.one_shot.lock().await.remove(&op);
        self.persistent.lock().await.remove(&op);
    }

    pub async fn set_latency(&self, op: TransportOp, latency: Duration) {
        self.latency.lock().await.insert(op, latency);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, op: TransportOp) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    pub async fn device_presets(&self) -> Vec<Preset> {
        self.presets.lock().await.clone()
    }

    pub async fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enter(
        &self,
        op: TransportOp,
        profile_token: Option<&str>,
        argument: Option<&str>,
        velocity: Option<&PtzVelocity>,
    ) -> TransportResult<()> {
        debug!(operation = %op, "mock transport call");
        self.calls.lock().await.push(RecordedCall {
            op,
            profile_token: profile_token.map(str::to_string),
            argument: argument.map(str::to_string),
            velocity: velocity.copied(),
        });

        let latency = self.latency.lock().await.get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self
            .one_shot
            .lock()
            .await
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = self.persistent.lock().await.get(&op) {
            return Err(error.clone());
        }
        Ok(())
    }

    async fn require_preset(&self, preset_id: &str) -> TransportResult<()> {
        if self.presets.lock().await.iter().any(|p| p.id == preset_id) {
            Ok(())
        } else {
            Err(TransportError::rejected(format!("no preset with token {}", preset_id)))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PtzTransport for MockTransport {
    async fn get_profiles(&self) -> TransportResult<Vec<MediaProfile>> {
        self.enter(TransportOp::GetProfiles, None, None, None).await?;
        Ok(self.profiles.lock().await.clone())
    }

    async fn get_capabilities(&self) -> TransportResult<DeclaredCapabilities> {
        self.enter(TransportOp::GetCapabilities, None, None, None)
            .await?;
        (*self.declared.lock().await)
            .ok_or_else(|| TransportError::Connection("capabilities endpoint unavailable".into()))
    }

    async fn continuous_move(
        &self,
        profile_token: &str,
        velocity: &PtzVelocity,
    ) -> TransportResult<()> {
        self.enter(
            TransportOp::ContinuousMove,
            Some(profile_token),
            None,
            Some(velocity),
        )
        .await
    }

    async fn stop(&self, profile_token: &str) -> TransportResult<()> {
        self.enter(TransportOp::Stop, Some(profile_token), None, None)
            .await
    }

    async fn get_presets(&self, profile_token: &str) -> TransportResult<Vec<Preset>> {
        self.enter(TransportOp::GetPresets, Some(profile_token), None, None)
            .await?;
        Ok(self.presets.lock().await.clone())
    }

    async fn set_preset(&self, profile_token: &str, label: &str) -> TransportResult<String> {
        self.enter(TransportOp::SetPreset, Some(profile_token), Some(label), None)
            .await?;
        let id = format!("tok-{}", self.next_preset_id.fetch_add(1, Ordering::SeqCst));
        self.presets.lock().await.push(Preset::new(id.clone(), label));
        Ok(id)
    }

    async fn goto_preset(&self, profile_token: &str, preset_id: &str) -> TransportResult<()> {
        self.enter(
            TransportOp::GotoPreset,
            Some(profile_token),
            Some(preset_id),
            None,
        )
        .await?;
        self.require_preset(preset_id).await
    }

    async fn remove_preset(&self, profile_token: &str, preset_id: &str) -> TransportResult<()> {
        self.enter(
            TransportOp::RemovePreset,
            Some(profile_token),
            Some(preset_id),
            None,
        )
        .await?;
        self.require_preset(preset_id).await?;
        self.presets.lock().await.retain(|p| p.id != preset_id);
        Ok(())
    }

    async fn goto_home_position(&self, profile_token: &str) -> TransportResult<()> {
        self.enter(TransportOp::GotoHomePosition, Some(profile_token), None, None)
            .await
    }

    async fn set_home_position(&self, profile_token: &str) -> TransportResult<()> {
        self.enter(TransportOp::SetHomePosition, Some(profile_token), None, None)
            .await
    }

    async fn reset(&self) -> TransportResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
