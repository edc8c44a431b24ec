use anyhow::Result;
use ptz_engine::{
    Ack, Capability, DeclaredCapabilities, DeviceRef, DeviceSession, EngineConfig, MockTransport,
    Preset, PtzCommand, PtzEngine, PtzError, PtzTransport, SessionState, Support, TransportError,
    TransportOp,
};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{LogConfig, LogFormat};
use tokio::time::Instant;

fn init_logging() {
    // Console only, so no guard to hold.
    let _ = telemetry::init_structured_logging(
        LogConfig::new("ptz-engine-tests")
            .with_format(LogFormat::Compact)
            .with_default_filter("ptz_engine=debug"),
    );
}

fn engine_for(mock: &Arc<MockTransport>) -> PtzEngine {
    init_logging();
    let mock = Arc::clone(mock);
    let connector = move |_: &DeviceRef| -> Result<Arc<dyn PtzTransport>, TransportError> {
        Ok(Arc::clone(&mock) as Arc<dyn PtzTransport>)
    };
    PtzEngine::new(EngineConfig::default(), Arc::new(connector))
}

async fn session_for(mock: &Arc<MockTransport>) -> Result<Arc<DeviceSession>> {
    init_logging();
    let transport = Arc::clone(mock) as Arc<dyn PtzTransport>;
    Ok(DeviceSession::connect("garden-cam", transport, &EngineConfig::default()).await?)
}

#[tokio::test(start_paused = true)]
async fn test_undeclared_device_is_detected_functionally() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_declared(Some(DeclaredCapabilities::none())));
    let session = session_for(&mock).await?;

    let model = session.model();
    assert!(model.can_move());
    assert!(model.can_zoom());
    assert!(model.can_stop());
    assert_eq!(model.support(Capability::Move), Support::Confirmed);
    assert_eq!(model.support(Capability::Zoom), Support::Confirmed);
    assert_eq!(model.support(Capability::Stop), Support::Confirmed);
    assert!(session.diagnostics().tolerant_mode);

    // Move, Stop and Zoom were all exercised, Home never was.
    assert_eq!(mock.call_count(TransportOp::ContinuousMove).await, 2);
    assert_eq!(mock.call_count(TransportOp::Stop).await, 1);
    assert_eq!(mock.call_count(TransportOp::GotoHomePosition).await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_metadata_still_allows_movement() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_declared(None));
    let session = session_for(&mock).await?;

    assert!(session.capabilities().can_move);
    assert_eq!(session.dispatch(PtzCommand::move_by(0.3, 0.3)).await?, Ack::Accepted);
    assert_eq!(session.dispatch(PtzCommand::Stop).await?, Ack::Accepted);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_preset_fault_disables_presets() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    mock.fail_always(TransportOp::GetPresets, TransportError::not_supported("ActionNotSupported"))
        .await;
    let session = session_for(&mock).await?;

    assert!(!session.model().can_use_presets());
    assert_eq!(session.capabilities().preset_count, 0);
    assert!(session.list_presets()?.is_empty());

    mock.clear_calls().await;
    for command in [
        PtzCommand::set_preset("Patio"),
        PtzCommand::goto_preset("1"),
        PtzCommand::remove_preset("1"),
    ] {
        let err = session.dispatch(command).await.unwrap_err();
        assert_eq!(err, PtzError::UnsupportedCapability(Capability::Presets));
    }
    assert!(mock.calls().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_goto_preset_fault_disables_presets_for_session() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_presets(vec![Preset::new("1", "Door")]));
    let session = session_for(&mock).await?;
    assert!(session.model().can_use_presets());

    mock.fail_next(TransportOp::GotoPreset, TransportError::not_supported("ActionNotSupported"))
        .await;
    let err = session.dispatch(PtzCommand::goto_preset("1")).await.unwrap_err();
    assert_eq!(err, PtzError::UnsupportedCapability(Capability::Presets));
    assert!(!session.model().can_use_presets());

    mock.clear_calls().await;
    let err = session.dispatch(PtzCommand::goto_preset("1")).await.unwrap_err();
    assert_eq!(err, PtzError::UnsupportedCapability(Capability::Presets));
    assert!(mock.calls().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_stop_refusal_keeps_nudges_bounded() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    mock.fail_next(TransportOp::Stop, TransportError::rejected("not moving")).await;
    let session = session_for(&mock).await?;
    assert_eq!(session.model().support(Capability::Stop), Support::Confirmed);

    mock.clear_calls().await;
    let nudge = PtzCommand::Move {
        pan: 0.5,
        tilt: 0.0,
        duration: Some(Duration::from_millis(300)),
    };
    assert_eq!(session.dispatch(nudge).await?, Ack::Accepted);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(mock.call_count(TransportOp::Stop).await, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_share_one_probe() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    let before = session.model().generation();

    mock.set_latency(TransportOp::GetProfiles, Duration::from_secs(1)).await;
    mock.clear_calls().await;

    let (first, second) = tokio::join!(session.refresh(), session.refresh());
    let (first, second) = (first?, second?);

    assert_eq!(mock.call_count(TransportOp::GetProfiles).await, 1);
    assert!(first > before);
    assert!(second > before);
    assert_eq!(session.model().generation(), first.max(second));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_generation_never_moves_backwards() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    let mut models = session.subscribe_model();
    mock.set_latency(TransportOp::GetPresets, Duration::from_millis(300)).await;

    let watcher = tokio::spawn(async move {
        let mut seen = vec![models.borrow_and_update().generation()];
        // Ends once the session, and with it the sender, is dropped.
        while models.changed().await.is_ok() {
            seen.push(models.borrow_and_update().generation());
        }
        seen
    });

    let refreshes = (0..3).map(|_| {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.refresh().await
        })
    });
    for task in refreshes.collect::<Vec<_>>() {
        task.await??;
    }
    session.refresh().await?;
    session.refresh().await?;
    let last = session.model().generation();
    drop(session);

    let seen = watcher.await?;
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&last));
    assert!(last >= 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_command_completes_during_refresh() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    mock.set_latency(TransportOp::GetProfiles, Duration::from_secs(2)).await;

    let refreshing = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state(), SessionState::Refreshing);

    assert_eq!(session.dispatch(PtzCommand::zoom_by(0.4)).await?, Ack::Accepted);
    assert_eq!(session.model().generation(), 1);

    refreshing.await??;
    assert_eq!(session.model().generation(), 2);
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_never_errors() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;

    session.dispatch(PtzCommand::move_by(-0.5, 0.0)).await?;
    assert_eq!(session.dispatch(PtzCommand::Stop).await?, Ack::Accepted);
    assert_eq!(session.dispatch(PtzCommand::Stop).await?, Ack::Accepted);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_preset_lifecycle() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_next_preset_id(7));
    let session = session_for(&mock).await?;

    let ack = session.dispatch(PtzCommand::set_preset("Patio")).await?;
    assert_eq!(
        ack,
        Ack::PresetCreated {
            preset: Preset::new("tok-7", "Patio")
        }
    );
    assert!(session.list_presets()?.contains(&Preset::new("tok-7", "Patio")));
    assert_eq!(session.capabilities().preset_count, 1);

    mock.clear_calls().await;
    assert_eq!(session.dispatch(PtzCommand::goto_preset("tok-7")).await?, Ack::Accepted);
    let calls = mock.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, TransportOp::GotoPreset);
    assert_eq!(calls[0].argument.as_deref(), Some("tok-7"));

    mock.clear_calls().await;
    let err = session
        .dispatch(PtzCommand::goto_preset("nonexistent"))
        .await
        .unwrap_err();
    assert_eq!(err, PtzError::UnknownPreset("nonexistent".into()));
    assert!(mock.calls().await.is_empty());

    session.dispatch(PtzCommand::remove_preset("tok-7")).await?;
    assert!(session.list_presets()?.is_empty());
    assert!(mock.device_presets().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_labels_keep_distinct_tokens() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;

    session.dispatch(PtzCommand::set_preset("Door")).await?;
    session.dispatch(PtzCommand::set_preset("Door")).await?;
    let presets = session.list_presets()?;
    assert_eq!(presets.len(), 2);
    assert_ne!(presets[0].id, presets[1].id);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_home_is_confirmed_on_first_success() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    assert_eq!(session.model().support(Capability::Home), Support::Unknown);
    assert!(!session.capabilities().can_use_home);

    assert_eq!(session.dispatch(PtzCommand::GotoHome).await?, Ack::Accepted);
    assert!(session.capabilities().can_use_home);

    session.refresh().await?;
    assert_eq!(session.model().support(Capability::Home), Support::Confirmed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_home_fault_is_sticky_for_the_session() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_declared(Some(DeclaredCapabilities::full())));
    mock.fail_always(
        TransportOp::GotoHomePosition,
        TransportError::not_supported("ActionNotSupported"),
    )
    .await;
    let session = session_for(&mock).await?;
    assert!(session.capabilities().can_use_home);

    let err = session.dispatch(PtzCommand::GotoHome).await.unwrap_err();
    assert_eq!(err, PtzError::UnsupportedCapability(Capability::Home));
    assert!(!session.capabilities().can_use_home);

    session.refresh().await?;
    assert_eq!(session.model().support(Capability::Home), Support::Unsupported);

    mock.clear_calls().await;
    let err = session.dispatch(PtzCommand::SetHome).await.unwrap_err();
    assert_eq!(err, PtzError::UnsupportedCapability(Capability::Home));
    assert!(mock.calls().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hung_device_fails_within_bounded_time() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    mock.set_latency(TransportOp::ContinuousMove, Duration::from_secs(3600)).await;

    let started = Instant::now();
    let err = session
        .dispatch(PtzCommand::move_by(0.2, 0.2))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PtzError::CommandFailed {
            capability: Capability::Move,
            attempts: 3
        }
    );
    // 3 x 5s timeout + 200ms + 400ms backoff
    assert!(started.elapsed() < Duration::from_secs(16));
    assert!(session.model().can_move());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_engine_facade_round_trip() -> Result<()> {
    let mock = Arc::new(MockTransport::new().with_presets(vec![Preset::new("1", "Gate")]));
    let engine = engine_for(&mock);
    let handle = engine
        .connect(DeviceRef::new("driveway", "192.168.1.40").with_credentials("admin", "admin"))
        .await?;

    let snapshot = engine.capabilities_snapshot(handle).await?;
    assert!(snapshot.can_move && snapshot.can_zoom);
    assert_eq!(snapshot.preset_count, 1);
    assert_eq!(engine.list_presets(handle).await?, vec![Preset::new("1", "Gate")]);
    assert_eq!(
        engine.dispatch(handle, PtzCommand::goto_preset("1")).await?,
        Ack::Accepted
    );

    let mut models = engine.session(handle).await?.subscribe_model();
    engine.refresh(handle).await?;
    models.wait_for(|m| m.generation() >= 2).await?;

    let diagnostics = engine.diagnostics(handle).await?;
    assert_eq!(diagnostics.device, "driveway");
    assert_eq!(diagnostics.generation, 2);

    engine.dispose(handle).await?;
    assert!(mock.is_closed());
    assert_eq!(
        engine.capabilities_snapshot(handle).await.unwrap_err(),
        PtzError::UnknownSession(handle)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_independent() -> Result<()> {
    let healthy = Arc::new(MockTransport::new());
    let broken = Arc::new(MockTransport::new());
    broken
        .fail_always(TransportOp::ContinuousMove, TransportError::not_supported("fixed camera"))
        .await;

    let a = session_for(&healthy).await?;
    let b = session_for(&broken).await?;

    assert!(a.capabilities().can_move);
    assert!(!b.capabilities().can_move);
    assert_eq!(a.dispatch(PtzCommand::move_by(0.1, 0.0)).await?, Ack::Accepted);
    assert_eq!(
        b.dispatch(PtzCommand::move_by(0.1, 0.0)).await.unwrap_err(),
        PtzError::UnsupportedCapability(Capability::Move)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_outcomes_are_exported_as_metrics() -> Result<()> {
    let mock = Arc::new(MockTransport::new());
    let session = session_for(&mock).await?;
    mock.fail_next(TransportOp::ContinuousMove, TransportError::invalid_position("tilt limit"))
        .await;
    assert_eq!(session.dispatch(PtzCommand::move_by(0.0, 1.0)).await?, Ack::AtLimit);

    let exported = telemetry::encode_metrics()?;
    assert!(exported.contains("ptz_commands_total"));
    assert!(exported.contains("outcome=\"at_limit\""));
    assert!(exported.contains("ptz_probe_duration_seconds"));
    Ok(())
}
