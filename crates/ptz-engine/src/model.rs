use crate::types::{Capability, CapabilitySnapshot, Preset, PtzLimits, Support};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Immutable snapshot of what one device can do.
///
/// Snapshots are never edited once published. Runtime evidence (a fault,
/// a confirmed Home call, a preset created) produces a modified copy at the
/// same generation, installed through [`ModelStore`].
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityModel {
    pub(crate) generation: u64,
    pub(crate) probed_at: DateTime<Utc>,
    pub(crate) profile_token: String,
    pub(crate) limits: Option<PtzLimits>,
    pub(crate) move_support: Support,
    pub(crate) zoom_support: Support,
    pub(crate) stop_support: Support,
    pub(crate) preset_support: Support,
    pub(crate) home_support: Support,
    pub(crate) presets: Vec<Preset>,
    pub(crate) tolerant: bool,
}

impl CapabilityModel {
    pub(crate) fn new(generation: u64, profile_token: impl Into<String>) -> Self {
        Self {
            generation,
            probed_at: Utc::now(),
            profile_token: profile_token.into(),
            limits: None,
            move_support: Support::Unknown,
            zoom_support: Support::Unknown,
            stop_support: Support::Unknown,
            preset_support: Support::Unknown,
            home_support: Support::Unknown,
            presets: Vec::new(),
            tolerant: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn probed_at(&self) -> DateTime<Utc> {
        self.probed_at
    }

    pub fn profile_token(&self) -> &str {
        &self.profile_token
    }

    pub fn limits(&self) -> Option<&PtzLimits> {
        self.limits.as_ref()
    }

    /// True when functional probing confirmed something the device's
    /// metadata left out.
    pub fn is_tolerant(&self) -> bool {
        self.tolerant
    }

    pub fn support(&self, capability: Capability) -> Support {
        match capability {
            Capability::Move => self.move_support,
            Capability::Zoom => self.zoom_support,
            Capability::Stop => self.stop_support,
            Capability::Presets => self.preset_support,
            Capability::Home => self.home_support,
        }
    }

    pub fn can_move(&self) -> bool {
        self.move_support.is_exposed()
    }

    pub fn can_zoom(&self) -> bool {
        self.zoom_support.is_exposed()
    }

    pub fn can_stop(&self) -> bool {
        self.stop_support.is_exposed()
    }

    pub fn can_use_presets(&self) -> bool {
        self.preset_support.is_exposed()
    }

    pub fn can_use_home(&self) -> bool {
        self.home_support.is_exposed()
    }

    /// Presets in device-reported order.
    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn preset_by_id(&self, id: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            can_move: self.can_move(),
            can_zoom: self.can_zoom(),
            can_use_home: self.can_use_home(),
            preset_count: if self.preset_support.permits_attempt() {
                self.presets.len()
            } else {
                0
            },
        }
    }

    pub(crate) fn with_support(&self, capability: Capability, support: Support) -> Self {
        let mut next = self.clone();
        match capability {
            Capability::Move => next.move_support = support,
            Capability::Zoom => next.zoom_support = support,
            Capability::Stop => next.stop_support = support,
            Capability::Presets => next.preset_support = support,
            Capability::Home => next.home_support = support,
        }
        next
    }

    pub(crate) fn with_presets(&self, presets: Vec<Preset>) -> Self {
        Self {
            preset_support: Support::Confirmed,
            presets,
            ..self.clone()
        }
    }

    /// A device may hand back an existing token from SetPreset (overwrite);
    /// the entry keeps its place in the listing.
    pub(crate) fn with_preset_saved(&self, preset: Preset) -> Self {
        let mut presets = self.presets.clone();
        match presets.iter_mut().find(|p| p.id == preset.id) {
            Some(existing) => *existing = preset,
            None => presets.push(preset),
        }
        self.with_presets(presets)
    }

    pub(crate) fn with_preset_removed(&self, id: &str) -> Self {
        let presets = self
            .presets
            .iter()
            .filter(|p| p.id != id)
            .cloned()
            .collect();
        self.with_presets(presets)
    }
}

/// Publishes the current [`CapabilityModel`] of one session.
///
/// Readers get an `Arc` to a complete snapshot; writers replace the whole
/// snapshot under the channel's lock, so no reader sees a partial update.
pub(crate) struct ModelStore {
    tx: watch::Sender<Arc<CapabilityModel>>,
}

impl ModelStore {
    pub fn new(initial: CapabilityModel) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn current(&self) -> Arc<CapabilityModel> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CapabilityModel>> {
        self.tx.subscribe()
    }

    /// Install a freshly probed model unless a model of the same or a newer
    /// generation is already in place. Home evidence gathered at runtime
    /// (confirmed or rejected) outlives the probe for the whole session.
    pub fn install(&self, mut model: CapabilityModel) -> bool {
        self.tx.send_if_modified(|current| {
            if model.generation <= current.generation {
                return false;
            }
            if matches!(
                current.home_support,
                Support::Confirmed | Support::Unsupported
            ) {
                model.home_support = current.home_support;
            }
            *current = Arc::new(model);
            true
        })
    }

    /// Copy-on-write edit of whatever snapshot is current. `edit` returns
    /// `None` to leave the model untouched.
    pub fn update<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&CapabilityModel) -> Option<CapabilityModel>,
    {
        self.tx.send_if_modified(|current| match edit(&**current) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(generation: u64) -> CapabilityModel {
        let mut model = CapabilityModel::new(generation, "profile_1");
        model.move_support = Support::Confirmed;
        model.zoom_support = Support::Unknown;
        model.home_support = Support::Declared;
        model.preset_support = Support::Confirmed;
        model.presets = vec![Preset::new("1", "Door"), Preset::new("2", "Yard")];
        model
    }

    #[test]
    fn queries_follow_support_flags() {
        let model = model(1);
        assert!(model.can_move());
        assert!(!model.can_zoom());
        assert!(model.can_use_home());
        assert_eq!(model.preset_by_id("2").map(|p| p.label.as_str()), Some("Yard"));
        assert!(model.preset_by_id("3").is_none());
        assert_eq!(
            model.snapshot(),
            CapabilitySnapshot {
                can_move: true,
                can_zoom: false,
                can_use_home: true,
                preset_count: 2,
            }
        );
    }

    #[test]
    fn preset_edits_keep_device_order() {
        let model = model(1)
            .with_preset_saved(Preset::new("3", "Gate"))
            .with_preset_saved(Preset::new("1", "Front door"));
        let ids: Vec<_> = model.presets().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(model.presets()[0].label, "Front door");

        let model = model.with_preset_removed("2");
        let ids: Vec<_> = model.presets().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn install_rejects_stale_generations() {
        let store = ModelStore::new(model(2));
        assert!(!store.install(model(1)));
        assert!(!store.install(model(2)));
        assert_eq!(store.current().generation(), 2);
        assert!(store.install(model(5)));
        assert_eq!(store.current().generation(), 5);
    }

    #[test]
    fn runtime_home_evidence_survives_reprobe() {
        let store = ModelStore::new(model(1));
        store.update(|m| Some(m.with_support(Capability::Home, Support::Unsupported)));
        assert!(store.install(model(2)));
        assert_eq!(store.current().support(Capability::Home), Support::Unsupported);
        assert!(!store.current().can_use_home());
    }

    #[test]
    fn readers_keep_their_snapshot_across_updates() {
        let store = ModelStore::new(model(1));
        let before = store.current();
        store.update(|m| Some(m.with_support(Capability::Move, Support::Unsupported)));
        assert!(before.can_move());
        assert!(!store.current().can_move());
    }

    #[test]
    fn unsupported_presets_report_zero_count() {
        let model = model(1).with_support(Capability::Presets, Support::Unsupported);
        assert_eq!(model.snapshot().preset_count, 0);
    }
}
