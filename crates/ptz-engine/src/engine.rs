use crate::config::EngineConfig;
use crate::error::{PtzError, TransportError};
use crate::session::DeviceSession;
use crate::transport::TransportConnector;
use crate::types::{
    Ack, CapabilitySnapshot, DeviceRef, Preset, PtzCommand, SessionDiagnostics, SessionHandle,
};
use std::collections::HashMap;
use std::sync::Arc;
use telemetry::metrics::PTZ_ACTIVE_SESSIONS;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

/// Host-facing entry point. Owns every device session and routes calls by
/// [`SessionHandle`].
pub struct PtzEngine {
    config: EngineConfig,
    connector: Arc<dyn TransportConnector>,
    sessions: RwLock<HashMap<SessionHandle, Arc<DeviceSession>>>,
}

impl PtzEngine {
    pub fn new(config: EngineConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            config,
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Build an engine configured from `PTZ_*` environment variables.
    pub fn from_env(connector: Arc<dyn TransportConnector>) -> anyhow::Result<Self> {
        Ok(Self::new(EngineConfig::from_env()?, connector))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a transport to the device, probe it and register the session.
    pub async fn connect(&self, device: DeviceRef) -> Result<SessionHandle, PtzError> {
        info!(device = %device.name, address = %device.address, "connecting PTZ device");

        let opened = timeout(self.config.call_timeout, self.connector.open(&device)).await;
        let transport = match opened {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(device = %device.name, error = %e, "failed to open transport");
                return Err(PtzError::DeviceUnreachable(e));
            }
            Err(_) => {
                warn!(device = %device.name, "timed out opening transport");
                return Err(PtzError::DeviceUnreachable(TransportError::Timeout(
                    self.config.call_timeout,
                )));
            }
        };

        let session = DeviceSession::connect(device.name.clone(), transport, &self.config).await?;
        let handle = SessionHandle::new();
        self.sessions.write().await.insert(handle, session);
        PTZ_ACTIVE_SESSIONS.inc();

        info!(device = %device.name, session = %handle, "PTZ device connected");
        Ok(handle)
    }

    pub async fn session(&self, handle: SessionHandle) -> Result<Arc<DeviceSession>, PtzError> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .cloned()
            .ok_or(PtzError::UnknownSession(handle))
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        handle: SessionHandle,
        command: PtzCommand,
    ) -> Result<Ack, PtzError> {
        self.session(handle).await?.dispatch(command).await
    }

    pub async fn list_presets(&self, handle: SessionHandle) -> Result<Vec<Preset>, PtzError> {
        self.session(handle).await?.list_presets()
    }

    pub async fn reload_presets(&self, handle: SessionHandle) -> Result<Vec<Preset>, PtzError> {
        self.session(handle).await?.reload_presets().await
    }

    pub async fn capabilities_snapshot(
        &self,
        handle: SessionHandle,
    ) -> Result<CapabilitySnapshot, PtzError> {
        Ok(self.session(handle).await?.capabilities())
    }

    /// Queue a capability refresh. Returns before the probe runs.
    pub async fn refresh(&self, handle: SessionHandle) -> Result<(), PtzError> {
        self.session(handle).await?.request_refresh();
        Ok(())
    }

    pub async fn diagnostics(&self, handle: SessionHandle) -> Result<SessionDiagnostics, PtzError> {
        Ok(self.session(handle).await?.diagnostics())
    }

    /// Close the session and forget the handle.
    pub async fn dispose(&self, handle: SessionHandle) -> Result<(), PtzError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&handle)
            .ok_or(PtzError::UnknownSession(handle))?;
        session.dispose().await;
        PTZ_ACTIVE_SESSIONS.dec();
        Ok(())
    }

    /// Dispose every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "shutting down PTZ sessions");
        for (_, session) in sessions {
            session.dispose().await;
            PTZ_ACTIVE_SESSIONS.dec();
        }
    }
}
