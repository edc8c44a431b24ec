use crate::config::EngineConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::PtzError;
use crate::model::{CapabilityModel, ModelStore};
use crate::prober::CapabilityProber;
use crate::retry::TransportCaller;
use crate::transport::PtzTransport;
use crate::types::{
    Ack, Capability, CapabilitySnapshot, Preset, PtzCommand, SessionDiagnostics, SessionState,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use telemetry::metrics::PTZ_SESSION_REFRESHES;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the engine holds for one physical device.
///
/// Commands and refreshes may run concurrently. Commands read the model
/// snapshot current at their start; a refresh swaps in a complete new one.
pub struct DeviceSession {
    device: String,
    caller: Arc<TransportCaller>,
    prober: CapabilityProber,
    store: Arc<ModelStore>,
    dispatcher: CommandDispatcher,
    state_tx: watch::Sender<SessionState>,
    refresh_lock: Mutex<()>,
    completed_probes: AtomicU64,
    next_generation: AtomicU64,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl DeviceSession {
    /// Probe the device and open a session on success. The transport is
    /// closed again if the probe fails.
    pub async fn connect(
        device: impl Into<String>,
        transport: Arc<dyn PtzTransport>,
        config: &EngineConfig,
    ) -> Result<Arc<Self>, PtzError> {
        let device = device.into();
        let caller = Arc::new(TransportCaller::new(
            device.clone(),
            transport,
            config.retry_policy(),
        ));
        let prober = CapabilityProber::new(Arc::clone(&caller), config.preset_probe_retries);
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);

        state_tx.send_replace(SessionState::Probing);
        info!(device = %device, "probing PTZ capabilities");
        let model = match prober.probe(1).await {
            Ok(model) => model,
            Err(e) => {
                caller.transport().close().await;
                return Err(e);
            }
        };

        let store = Arc::new(ModelStore::new(model));
        let cancel = CancellationToken::new();
        let (degraded_tx, degraded_rx) = mpsc::unbounded_channel();
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&caller),
            Arc::clone(&store),
            config.degrade_threshold,
            config.preset_probe_retries,
            degraded_tx,
            cancel.clone(),
        );
        state_tx.send_replace(SessionState::Ready);

        let session = Arc::new(Self {
            device,
            caller,
            prober,
            store,
            dispatcher,
            state_tx,
            refresh_lock: Mutex::new(()),
            completed_probes: AtomicU64::new(1),
            next_generation: AtomicU64::new(2),
            disposed: AtomicBool::new(false),
            cancel,
        });
        session.spawn_degrade_listener(degraded_rx);

        info!(device = %session.device, "PTZ session ready");
        Ok(session)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn dispatch(&self, command: PtzCommand) -> Result<Ack, PtzError> {
        self.ensure_open()?;
        self.dispatcher.dispatch(command).await
    }

    /// Cached preset listing in device order. Empty when presets are
    /// unsupported.
    pub fn list_presets(&self) -> Result<Vec<Preset>, PtzError> {
        self.ensure_open()?;
        let model = self.store.current();
        if !model.support(Capability::Presets).permits_attempt() {
            return Ok(Vec::new());
        }
        Ok(model.presets().to_vec())
    }

    pub async fn reload_presets(&self) -> Result<Vec<Preset>, PtzError> {
        self.ensure_open()?;
        self.dispatcher.reload_presets().await
    }

    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.store.current().snapshot()
    }

    pub fn model(&self) -> Arc<CapabilityModel> {
        self.store.current()
    }

    pub fn subscribe_model(&self) -> watch::Receiver<Arc<CapabilityModel>> {
        self.store.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let model = self.store.current();
        SessionDiagnostics {
            device: self.device.clone(),
            state: self.state(),
            generation: model.generation(),
            probed_at: model.probed_at(),
            profile_token: model.profile_token().to_string(),
            tolerant_mode: model.is_tolerant(),
            transport_retries: self.caller.retries(),
            transport_resets: self.caller.resets(),
        }
    }

    /// Re-probe the device and install the result.
    ///
    /// Only one probe runs at a time. A caller that arrives while a probe is
    /// in flight waits for it and returns its result instead of probing
    /// again. Returns the generation of the installed model.
    pub async fn refresh(&self) -> Result<u64, PtzError> {
        self.ensure_open()?;
        let seen = self.completed_probes.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.completed_probes.load(Ordering::SeqCst) != seen {
            PTZ_SESSION_REFRESHES.with_label_values(&["coalesced"]).inc();
            debug!(device = %self.device, "refresh coalesced with in-flight probe");
            return Ok(self.store.current().generation());
        }
        self.ensure_open()?;

        let previous = self.state();
        self.set_state(SessionState::Refreshing);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        debug!(device = %self.device, generation, "refreshing capabilities");

        let result = self.prober.probe(generation).await;
        self.completed_probes.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(model) => {
                if self.store.install(model) {
                    PTZ_SESSION_REFRESHES.with_label_values(&["installed"]).inc();
                } else {
                    PTZ_SESSION_REFRESHES.with_label_values(&["stale"]).inc();
                    debug!(device = %self.device, generation, "discarding stale probe result");
                }
                self.set_state(SessionState::Ready);
                Ok(self.store.current().generation())
            }
            Err(e) => {
                PTZ_SESSION_REFRESHES.with_label_values(&["failed"]).inc();
                warn!(
                    device = %self.device,
                    generation,
                    error = %e,
                    "refresh failed, keeping previous model"
                );
                let restored = match previous {
                    SessionState::Degraded(capability) => SessionState::Degraded(capability),
                    _ => SessionState::Ready,
                };
                self.set_state(restored);
                Err(e)
            }
        }
    }

    /// Start a refresh in the background and return immediately.
    pub fn request_refresh(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.refresh().await {
                debug!(device = %session.device, error = %e, "background refresh failed");
            }
        });
    }

    /// Stop background work and release the transport. Safe to call more
    /// than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.state_tx.send_replace(SessionState::Disposed);
        self.caller.transport().close().await;
        info!(device = %self.device, "PTZ session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), PtzError> {
        if self.is_disposed() {
            Err(PtzError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Disposed is terminal.
    fn set_state(&self, next: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disposed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn spawn_degrade_listener(
        self: &Arc<Self>,
        mut degraded_rx: mpsc::UnboundedReceiver<Capability>,
    ) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let capability = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = degraded_rx.recv() => match next {
                        Some(capability) => capability,
                        None => break,
                    },
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };

                warn!(
                    device = %session.device,
                    capability = %capability,
                    "session degraded, refreshing capabilities"
                );
                session.set_state(SessionState::Degraded(capability));
                if let Err(e) = session.refresh().await {
                    warn!(device = %session.device, error = %e, "refresh after degrade failed");
                }
            }
        });
    }
}
