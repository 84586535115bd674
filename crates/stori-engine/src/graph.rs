//! Graph mutation coordinator
//!
//! Owns the per-track node groups and applies topology changes to the live
//! render graph. Every mutation runs inside one serialized section (the
//! coordinator state mutex), so at most one rebuild is in flight.
//!
//! ## Track topology
//! ```text
//!   with active plugins:
//!     source ─► chain-in ─► plugin … plugin ─► chain-out ─► EQ ─► volume ─► pan ─► bus
//!   without:
//!     source ─────────────────────────────────────────────► EQ ─► volume ─► pan ─► bus
//! ```
//!
//! The chain mixers exist only while the chain is realized (at least one
//! active plugin).
//!
//! ## Rebuild sequence
//! 1. reset DSP of units about to be disconnected
//! 2. disconnect downstream-first, per node output before input
//! 3. realize or unrealize the chain, detach nodes no longer in the path
//! 4. connect the path and its tail into the output bus
//! 5. cache the snapshot, validate
//!
//! Only the target track's nodes are touched.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stori_core::{BusId, InstrumentKind, PluginDescriptor, TrackId};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::health::{ErrorComponent, ErrorSeverity};
use crate::plugin::{EffectsChain, InstrumentSlot, PluginSlot, PluginSlotId, UnitFactory};
use crate::render::{Endpoint, NodeKey, NodeRole, RenderGraph};
use crate::rt::RtCounter;
use crate::timer::DeadlineTimer;

// ═══════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════

/// Topology-relevant state of one track, compared to skip redundant rebuilds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStateSnapshot {
    pub plugin_count: usize,
    pub has_active_plugins: bool,
    pub is_realized: bool,
    pub has_instrument: bool,
    pub instrument_kind: InstrumentKind,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACK NODE GROUP
// ═══════════════════════════════════════════════════════════════════════════

pub struct TrackNodeGroup {
    pub id: TrackId,
    pub name: String,
    pub instrument: InstrumentSlot,
    pub chain: EffectsChain,
    pub output_bus: BusId,
    /// Nodes attached to the render graph
    attached: BTreeSet<NodeKey>,
    /// Nodes connected in signal order, source first
    wired: Vec<NodeKey>,
}

impl TrackNodeGroup {
    fn new(id: TrackId, name: String, output_bus: BusId) -> Self {
        Self {
            id,
            name,
            instrument: InstrumentSlot::None,
            chain: EffectsChain::default(),
            output_bus,
            attached: BTreeSet::new(),
            wired: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> GraphStateSnapshot {
        GraphStateSnapshot {
            plugin_count: self.chain.len(),
            has_active_plugins: self.chain.has_active(),
            is_realized: self.chain.realized,
            has_instrument: self.instrument.kind().is_instrument(),
            instrument_kind: self.instrument.kind(),
        }
    }

    #[inline]
    pub fn node(&self, role: NodeRole) -> NodeKey {
        NodeKey::new(self.id, role)
    }

    /// Path the next rebuild will connect
    fn signal_path(&self) -> Vec<NodeKey> {
        let mut path = Vec::with_capacity(self.chain.len() + 6);
        path.push(self.instrument.source_node(self.id));
        if self.chain.has_active() {
            path.push(self.node(NodeRole::ChainInput));
            path.extend(self.chain.active().map(|slot| slot.node(self.id)));
            path.push(self.node(NodeRole::ChainOutput));
        }
        path.extend([
            self.node(NodeRole::Eq),
            self.node(NodeRole::Volume),
            self.node(NodeRole::Pan),
        ]);
        path
    }

    pub fn wired(&self) -> &[NodeKey] {
        &self.wired
    }

    pub fn attached(&self) -> impl Iterator<Item = &NodeKey> {
        self.attached.iter()
    }
}

impl fmt::Debug for TrackNodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackNodeGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instrument", &self.instrument)
            .field("plugins", &self.chain.len())
            .field("realized", &self.chain.realized)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct GraphState {
    tracks: BTreeMap<TrackId, TrackNodeGroup>,
    snapshots: HashMap<TrackId, GraphStateSnapshot>,
    pending: BTreeSet<TrackId>,
    timer: DeadlineTimer,
    issues: BTreeMap<TrackId, Vec<String>>,
    rebuilds: HashMap<TrackId, u64>,
    next_slot: u64,
}

pub struct GraphCoordinator {
    ctx: Arc<EngineContext>,
    render: Arc<dyn RenderGraph>,
    factory: Arc<dyn UnitFactory>,
    debounce: Duration,
    state: Mutex<GraphState>,
    generation: AtomicU64,
    mutation_count: RtCounter,
}

impl GraphCoordinator {
    pub fn new(
        ctx: Arc<EngineContext>,
        render: Arc<dyn RenderGraph>,
        factory: Arc<dyn UnitFactory>,
        debounce: Duration,
    ) -> Self {
        Self {
            ctx,
            render,
            factory,
            debounce,
            state: Mutex::new(GraphState::default()),
            generation: AtomicU64::new(0),
            mutation_count: RtCounter::new(),
        }
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn check_generation(&self, captured: u64, op: &str) -> EngineResult<()> {
        let current = self.generation();
        if current == captured {
            return Ok(());
        }
        self.ctx.errors.record(
            ErrorSeverity::Warning,
            ErrorComponent::Operation,
            format!("{op} abandoned: graph changed (generation {captured} -> {current})"),
        );
        Err(EngineError::StaleGeneration { captured, current })
    }

    fn refresh_latency(&self, group: &TrackNodeGroup) {
        let sample_rate = self.render.format().sample_rate;
        self.ctx
            .pdc
            .set_track_latency(group.id, group.chain.latency_samples(sample_rate));
    }

    // ─── Track structure ────────────────────────────────────────────────────

    /// Add an audio track and wire it to its bus
    pub fn add_track(&self, id: TrackId, name: &str, output_bus: BusId) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.tracks.contains_key(&id) {
            return Err(EngineError::DuplicateTrack(id));
        }
        let group = TrackNodeGroup::new(id, name.to_string(), output_bus);
        self.refresh_latency(&group);
        state.tracks.insert(id, group);
        self.bump_generation();
        log::info!("[Graph] Added {} '{}'", id, name);

        self.rebuild_if_needed_locked(&mut state, id, true).map(|_| ())
    }

    /// Disconnect, detach and forget a track
    ///
    /// If the render graph refuses part of the teardown the track is kept,
    /// so the call can be retried or the track rebuilt.
    pub fn remove_track(&self, id: TrackId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let group = state.tracks.get_mut(&id).ok_or(EngineError::UnknownTrack(id))?;
        self.bump_generation();

        if let Err(e) = self.teardown(group) {
            state.snapshots.remove(&id);
            self.render_failed(id, &e);
            return Err(e);
        }

        state.tracks.remove(&id);
        state.snapshots.remove(&id);
        state.pending.remove(&id);
        state.issues.remove(&id);
        state.rebuilds.remove(&id);

        self.ctx.pdc.remove_track(id);
        if let Some(instrument) = self.ctx.instruments.unregister(id) {
            instrument.all_notes_off();
        }
        log::info!("[Graph] Removed {}", id);
        self.restore_stable(id);
        Ok(())
    }

    /// Downstream first; progress is kept in the group so a retry resumes
    fn teardown(&self, group: &mut TrackNodeGroup) -> EngineResult<()> {
        for node in group.wired.iter().rev() {
            self.render.disconnect_output(*node)?;
            self.render.disconnect_input(*node)?;
        }
        group.wired.clear();

        let attached: Vec<NodeKey> = group.attached.iter().copied().collect();
        for node in attached {
            self.render.detach(node)?;
            group.attached.remove(&node);
        }
        Ok(())
    }

    /// Remove every track
    pub fn clear(&self) {
        self.cancel_scheduled();
        for id in self.track_ids() {
            if let Err(e) = self.remove_track(id) {
                log::warn!("[Graph] Failed to remove {} during clear: {}", id, e);
            }
        }
    }

    // ─── Plugins & instruments ──────────────────────────────────────────────

    /// Instantiate and insert a plugin (at `index`, or the end)
    ///
    /// Refused while the graph is unstable or another install is running.
    pub fn insert_plugin(
        &self,
        track: TrackId,
        descriptor: &PluginDescriptor,
        index: Option<usize>,
    ) -> EngineResult<PluginSlotId> {
        if !self.ctx.flags.graph_stable.get() {
            log::warn!("[Graph] Plugin insert on {} refused: graph unstable", track);
            return Err(EngineError::GraphUnstable);
        }
        let _install = self.ctx.flags.begin_plugin_install()?;
        self.install_plugin(track, descriptor, index)
    }

    /// Insert without the stability gate (project restore)
    pub(crate) fn install_plugin(
        &self,
        track: TrackId,
        descriptor: &PluginDescriptor,
        index: Option<usize>,
    ) -> EngineResult<PluginSlotId> {
        let captured = self.generation();
        if !self.has_track(track) {
            return Err(EngineError::UnknownTrack(track));
        }

        let unit = self.factory.instantiate_plugin(descriptor)?;

        let mut state = self.state.lock();
        self.check_generation(captured, "plugin insert")?;
        let id = PluginSlotId(state.next_slot);
        state.next_slot += 1;

        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;
        let index = index.unwrap_or(group.chain.len()).min(group.chain.len());
        group.chain.slots.insert(
            index,
            PluginSlot {
                id,
                unit,
                bypassed: descriptor.bypassed,
            },
        );
        self.refresh_latency(group);
        self.bump_generation();
        log::info!("[Graph] Inserted '{}' on {} at {} ({})", descriptor.name, track, index, id);

        self.rebuild_if_needed_locked(&mut state, track, false)?;
        Ok(id)
    }

    pub fn remove_plugin(&self, track: TrackId, slot: PluginSlotId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;
        let position = group
            .chain
            .slots
            .iter()
            .position(|s| s.id == slot)
            .ok_or(EngineError::UnknownPluginSlot(track, slot))?;

        let removed = group.chain.slots.remove(position);
        removed.unit.reset();
        self.refresh_latency(group);
        self.bump_generation();
        log::info!("[Graph] Removed '{}' from {}", removed.unit.name(), track);

        self.rebuild_if_needed_locked(&mut state, track, false).map(|_| ())
    }

    pub fn set_plugin_bypass(&self, track: TrackId, slot: PluginSlotId, bypassed: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;
        let plugin = group
            .chain
            .slot_mut(slot)
            .ok_or(EngineError::UnknownPluginSlot(track, slot))?;
        if plugin.bypassed == bypassed {
            return Ok(());
        }
        plugin.bypassed = bypassed;
        self.refresh_latency(group);
        // Active plugin order is invisible to the snapshot
        state.snapshots.remove(&track);
        self.bump_generation();
        log::info!("[Graph] {} on {} bypass: {}", slot, track, bypassed);

        self.rebuild_if_needed_locked(&mut state, track, false).map(|_| ())
    }

    /// Swap the track's instrument; `InstrumentKind::None` makes it an audio track
    pub fn set_instrument(&self, track: TrackId, kind: InstrumentKind) -> EngineResult<()> {
        let captured = self.generation();
        if !self.has_track(track) {
            return Err(EngineError::UnknownTrack(track));
        }

        let slot = self.factory.instantiate_instrument(kind, track)?;

        let mut state = self.state.lock();
        self.check_generation(captured, "instrument swap")?;
        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;

        let previous = std::mem::replace(&mut group.instrument, slot);
        if let Some(unit) = previous.instrument() {
            unit.all_notes_off();
        }
        match group.instrument.instrument() {
            Some(unit) => self.ctx.instruments.register(track, unit.clone()),
            None => {
                self.ctx.instruments.unregister(track);
            }
        }
        // Same-kind swaps are invisible to the snapshot
        state.snapshots.remove(&track);
        self.bump_generation();
        log::info!("[Graph] {} instrument: {}", track, kind.label());

        self.rebuild_if_needed_locked(&mut state, track, false).map(|_| ())
    }

    pub fn set_output_bus(&self, track: TrackId, bus: BusId) -> EngineResult<()> {
        let mut state = self.state.lock();
        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;
        if group.output_bus == bus {
            return Ok(());
        }
        group.output_bus = bus;
        state.snapshots.remove(&track);
        self.bump_generation();
        log::info!("[Graph] {} routed to bus {}", track, bus.0);

        self.rebuild_if_needed_locked(&mut state, track, false).map(|_| ())
    }

    /// Drop the cached snapshot so the next `rebuild_if_needed` runs
    pub fn invalidate_snapshot(&self, track: TrackId) {
        self.state.lock().snapshots.remove(&track);
    }

    // ─── Rebuild ────────────────────────────────────────────────────────────

    /// Rebuild when the track's snapshot differs from the cached one.
    /// Returns whether a rebuild ran.
    pub fn rebuild_if_needed(&self, track: TrackId, force: bool) -> EngineResult<bool> {
        let mut state = self.state.lock();
        self.rebuild_if_needed_locked(&mut state, track, force)
    }

    pub fn rebuild(&self, track: TrackId) -> EngineResult<()> {
        self.rebuild_if_needed(track, true).map(|_| ())
    }

    /// Rebuild every track; returns how many rebuilt
    pub fn rebuild_all(&self, force: bool) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let ids: Vec<TrackId> = state.tracks.keys().copied().collect();
        let mut rebuilt = 0;
        for id in ids {
            if self.rebuild_if_needed_locked(&mut state, id, force)? {
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    fn rebuild_if_needed_locked(&self, state: &mut GraphState, track: TrackId, force: bool) -> EngineResult<bool> {
        let group = state.tracks.get(&track).ok_or(EngineError::UnknownTrack(track))?;
        let current = group.snapshot();
        if !force && state.snapshots.get(&track) == Some(&current) {
            return Ok(false);
        }
        self.rebuild_locked(state, track)?;
        Ok(true)
    }

    fn rebuild_locked(&self, state: &mut GraphState, track: TrackId) -> EngineResult<()> {
        let group = state.tracks.get_mut(&track).ok_or(EngineError::UnknownTrack(track))?;
        let format = self.render.format();

        if let Err(e) = self.rewire(group) {
            state.snapshots.remove(&track);
            self.render_failed(track, &e);
            return Err(e);
        }

        state.snapshots.insert(track, group.snapshot());
        *state.rebuilds.entry(track).or_default() += 1;
        self.mutation_count.increment();
        log::debug!(
            "[Graph] Rebuilt {} ({} nodes, realized: {}, {} Hz)",
            track,
            group.wired.len(),
            group.chain.realized,
            format.sample_rate
        );

        let issues = self.validate_group(group);
        self.note_issues(&mut state.issues, track, issues);

        self.restore_stable(track);
        Ok(())
    }

    /// A successful mutation ends instability, unless a load owns the flag
    fn restore_stable(&self, track: TrackId) {
        let flags = &self.ctx.flags;
        if !flags.graph_stable.get() && !flags.loading.get() {
            flags.graph_stable.set(true);
            log::info!("[Graph] Graph stable again after {}", track);
        }
    }

    fn rewire(&self, group: &mut TrackNodeGroup) -> EngineResult<()> {
        for node in &group.wired {
            match node.role {
                NodeRole::Source(_) => group.instrument.reset(),
                NodeRole::Plugin(id) => {
                    if let Some(slot) = group.chain.slot(id) {
                        slot.unit.reset();
                    }
                }
                _ => {}
            }
        }

        for node in group.wired.iter().rev() {
            self.render.disconnect_output(*node)?;
            self.render.disconnect_input(*node)?;
        }
        group.wired.clear();

        let path = group.signal_path();
        let stale: Vec<NodeKey> = group
            .attached
            .iter()
            .filter(|node| !path.contains(node))
            .copied()
            .collect();
        for node in stale {
            self.render.detach(node)?;
            group.attached.remove(&node);
        }
        for node in &path {
            if !group.attached.contains(node) {
                self.render.attach(*node)?;
                group.attached.insert(*node);
            }
        }
        group.chain.realized = group.chain.has_active();

        group.wired = path;
        for pair in group.wired.windows(2) {
            self.render.connect(pair[0], Endpoint::Node(pair[1]))?;
        }
        if let Some(last) = group.wired.last() {
            self.render.connect(*last, Endpoint::Bus(group.output_bus))?;
        }
        Ok(())
    }

    fn render_failed(&self, track: TrackId, error: &EngineError) {
        self.ctx.flags.graph_stable.set(false);
        self.ctx.errors.record(
            ErrorSeverity::Error,
            ErrorComponent::Node,
            format!("Graph mutation on {track} failed: {error}"),
        );
    }

    // ─── Debounced scheduling ───────────────────────────────────────────────

    /// Queue a rebuild and (re)arm the debounce timer
    pub fn schedule_rebuild(&self, track: TrackId) {
        let now = self.ctx.now();
        let mut state = self.state.lock();
        if !state.tracks.contains_key(&track) {
            log::debug!("[Graph] Ignoring scheduled rebuild of unknown {}", track);
            return;
        }
        state.pending.insert(track);
        state.timer.arm(now, self.debounce);
    }

    /// Fire the debounce timer if due; returns the number of tracks rebuilt
    pub fn poll_scheduled(&self) -> usize {
        let now = self.ctx.now();
        let mut state = self.state.lock();
        if !state.timer.fire_if_due(now) {
            return 0;
        }

        let pending = std::mem::take(&mut state.pending);
        let mut rebuilt = 0;
        for track in pending {
            match self.rebuild_if_needed_locked(&mut state, track, false) {
                Ok(true) => rebuilt += 1,
                Ok(false) => {}
                Err(EngineError::UnknownTrack(_)) => {}
                Err(e) => log::warn!("[Graph] Scheduled rebuild of {} failed: {}", track, e),
            }
        }
        rebuilt
    }

    pub fn cancel_scheduled(&self) {
        let mut state = self.state.lock();
        state.timer.cancel();
        state.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    // ─── Validation ─────────────────────────────────────────────────────────

    /// Check the track's connections
    ///
    /// Not fatal. A node cut off from the signal path is recorded as a
    /// critical node error, a leaked chain mixer as a warning.
    pub fn validate_connections(&self, track: TrackId) -> EngineResult<Vec<String>> {
        let mut state = self.state.lock();
        let group = state.tracks.get(&track).ok_or(EngineError::UnknownTrack(track))?;
        let issues = self.validate_group(group);
        Ok(self.note_issues(&mut state.issues, track, issues))
    }

    fn validate_group(&self, group: &TrackNodeGroup) -> Vec<(ErrorSeverity, String)> {
        let mut issues = Vec::new();
        if group.wired.is_empty() {
            issues.push((ErrorSeverity::Critical, format!("{} is not wired", group.id)));
            return issues;
        }

        for node in &group.wired {
            if !self.render.is_attached(*node) {
                issues.push((ErrorSeverity::Critical, format!("{node} is detached")));
            } else if !self.render.has_output(*node) {
                issues.push((ErrorSeverity::Critical, format!("{node} has no output connection")));
            }
        }

        for role in [NodeRole::ChainInput, NodeRole::ChainOutput] {
            let node = group.node(role);
            if group.chain.realized {
                if !self.render.has_input(node) || !self.render.has_output(node) {
                    issues.push((
                        ErrorSeverity::Critical,
                        format!("realized chain boundary {node} is not fully connected"),
                    ));
                }
            } else if self.render.is_attached(node) {
                issues.push((
                    ErrorSeverity::Warning,
                    format!("unrealized chain left {node} attached"),
                ));
            }
        }
        issues
    }

    /// Keep the track's current issues; only ones not already on record
    /// for it reach the error tracker
    fn note_issues(
        &self,
        stored: &mut BTreeMap<TrackId, Vec<String>>,
        track: TrackId,
        issues: Vec<(ErrorSeverity, String)>,
    ) -> Vec<String> {
        if issues.is_empty() {
            stored.remove(&track);
            return Vec::new();
        }
        let previous = stored.remove(&track).unwrap_or_default();
        for (severity, message) in &issues {
            if !previous.contains(message) {
                self.ctx.errors.record(*severity, ErrorComponent::Node, message.clone());
            }
        }
        let messages: Vec<String> = issues.into_iter().map(|(_, message)| message).collect();
        stored.insert(track, messages.clone());
        messages
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Rebuilds performed since creation
    pub fn mutation_count(&self) -> u64 {
        self.mutation_count.get()
    }

    pub fn rebuild_count(&self, track: TrackId) -> u64 {
        self.state.lock().rebuilds.get(&track).copied().unwrap_or(0)
    }

    /// Snapshot of the track's current state
    pub fn snapshot(&self, track: TrackId) -> Option<GraphStateSnapshot> {
        self.state.lock().tracks.get(&track).map(|g| g.snapshot())
    }

    /// Snapshot cached by the last successful rebuild
    pub fn cached_snapshot(&self, track: TrackId) -> Option<GraphStateSnapshot> {
        self.state.lock().snapshots.get(&track).copied()
    }

    pub fn has_track(&self, track: TrackId) -> bool {
        self.state.lock().tracks.contains_key(&track)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.state.lock().tracks.keys().copied().collect()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn plugin_slots(&self, track: TrackId) -> Vec<PluginSlotId> {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map(|g| g.chain.slots.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    pub fn wired_path(&self, track: TrackId) -> Vec<NodeKey> {
        self.state
            .lock()
            .tracks
            .get(&track)
            .map(|g| g.wired.clone())
            .unwrap_or_default()
    }

    /// Validation issues kept from the last rebuild or validation
    pub fn validation_issues(&self) -> Vec<(TrackId, String)> {
        self.state
            .lock()
            .issues
            .iter()
            .flat_map(|(track, issues)| issues.iter().map(move |i| (*track, i.clone())))
            .collect()
    }

    pub fn render(&self) -> &Arc<dyn RenderGraph> {
        &self.render
    }
}

impl fmt::Debug for GraphCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphCoordinator")
            .field("tracks", &self.track_count())
            .field("generation", &self.generation())
            .field("mutations", &self.mutation_count())
            .finish()
    }
}
