//! Render engine boundary
//!
//! The core drives a render graph through [`RenderGraph`]: attach/detach
//! nodes and connect/disconnect them. [`MemoryGraph`] is the in-process
//! implementation used for offline operation; it keeps an operation log and
//! supports fault injection.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;

use stori_core::{BusId, InstrumentKind, TrackId};

use crate::error::{EngineError, EngineResult};
use crate::plugin::PluginSlotId;

// ═══════════════════════════════════════════════════════════════════════════
// NODE IDENTITY
// ═══════════════════════════════════════════════════════════════════════════

/// Stream format supplied by the render engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            channels: 2,
        }
    }
}

/// Position of a node inside a track's node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRole {
    /// Region player or instrument output
    Source(InstrumentKind),
    /// Mixer in front of the effects chain (realized chains only)
    ChainInput,
    Plugin(PluginSlotId),
    /// Mixer behind the effects chain (realized chains only)
    ChainOutput,
    Eq,
    Volume,
    Pan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    pub track: TrackId,
    pub role: NodeRole,
}

impl NodeKey {
    pub const fn new(track: TrackId, role: NodeRole) -> Self {
        Self { track, role }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.track, self.role)
    }
}

/// Connection destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Node(NodeKey),
    Bus(BusId),
}

impl From<NodeKey> for Endpoint {
    fn from(node: NodeKey) -> Self {
        Endpoint::Node(node)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDER GRAPH TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// Graph object owned by the render engine
pub trait RenderGraph: Send + Sync {
    /// Format queried once per rebuild
    fn format(&self) -> StreamFormat;

    fn is_running(&self) -> bool;

    /// Request engine start; may fail or complete asynchronously
    fn start(&self) -> EngineResult<()>;

    fn attach(&self, node: NodeKey) -> EngineResult<()>;

    fn detach(&self, node: NodeKey) -> EngineResult<()>;

    fn is_attached(&self, node: NodeKey) -> bool;

    fn connect(&self, from: NodeKey, to: Endpoint) -> EngineResult<()>;

    /// Remove every connection leaving `node`
    fn disconnect_output(&self, node: NodeKey) -> EngineResult<()>;

    /// Remove every connection entering `node`
    fn disconnect_input(&self, node: NodeKey) -> EngineResult<()>;

    fn has_output(&self, node: NodeKey) -> bool;

    fn has_input(&self, node: NodeKey) -> bool;

    fn attached_count(&self) -> usize;
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY GRAPH
// ═══════════════════════════════════════════════════════════════════════════

/// Recorded graph operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphOp {
    Start,
    Attach(NodeKey),
    Detach(NodeKey),
    Connect(NodeKey, Endpoint),
    DisconnectOutput(NodeKey),
    DisconnectInput(NodeKey),
}

impl GraphOp {
    /// Track touched by this operation
    pub fn track(&self) -> Option<TrackId> {
        match self {
            GraphOp::Start => None,
            GraphOp::Attach(n)
            | GraphOp::Detach(n)
            | GraphOp::Connect(n, _)
            | GraphOp::DisconnectOutput(n)
            | GraphOp::DisconnectInput(n) => Some(n.track),
        }
    }
}

#[derive(Default)]
struct MemoryGraphState {
    running: bool,
    attached: BTreeSet<NodeKey>,
    edges: BTreeSet<(NodeKey, Endpoint)>,
    ops: Vec<GraphOp>,
    start_failures: u32,
    start_delay_polls: u32,
    fail_connect_from: Option<NodeKey>,
    fail_detach: Option<NodeKey>,
    duplicate_attaches: u64,
    duplicate_connects: u64,
}

/// In-process render graph
pub struct MemoryGraph {
    format: StreamFormat,
    state: Mutex<MemoryGraphState>,
}

impl MemoryGraph {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            state: Mutex::new(MemoryGraphState::default()),
        }
    }

    /// Graph that reports running from the start
    pub fn running(format: StreamFormat) -> Self {
        let graph = Self::new(format);
        graph.state.lock().running = true;
        graph
    }

    /// Take and clear the operation log
    pub fn take_ops(&self) -> Vec<GraphOp> {
        std::mem::take(&mut self.state.lock().ops)
    }

    pub fn ops(&self) -> Vec<GraphOp> {
        self.state.lock().ops.clone()
    }

    pub fn ops_for(&self, track: TrackId) -> Vec<GraphOp> {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.track() == Some(track))
            .copied()
            .collect()
    }

    /// Destinations currently fed by `node`
    pub fn outputs_of(&self, node: NodeKey) -> Vec<Endpoint> {
        self.state
            .lock()
            .edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().edges.len()
    }

    /// Attach calls for nodes that were already attached
    pub fn duplicate_attaches(&self) -> u64 {
        self.state.lock().duplicate_attaches
    }

    /// Connect calls for edges that already existed
    pub fn duplicate_connects(&self) -> u64 {
        self.state.lock().duplicate_connects
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Make the next `count` start requests fail
    pub fn fail_starts(&self, count: u32) {
        self.state.lock().start_failures = count;
    }

    /// Report not-running for `polls` reads after a successful start
    pub fn delay_start(&self, polls: u32) {
        self.state.lock().start_delay_polls = polls;
    }

    /// Make every connect leaving `node` fail
    pub fn fail_connects_from(&self, node: Option<NodeKey>) {
        self.state.lock().fail_connect_from = node;
    }

    /// Make detaching `node` fail
    pub fn fail_detach(&self, node: Option<NodeKey>) {
        self.state.lock().fail_detach = node;
    }
}

impl RenderGraph for MemoryGraph {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn is_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.running && state.start_delay_polls > 0 {
            state.start_delay_polls -= 1;
            return false;
        }
        state.running
    }

    fn start(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::Start);
        if state.start_failures > 0 {
            state.start_failures -= 1;
            return Err(EngineError::Render("engine start refused".into()));
        }
        state.running = true;
        Ok(())
    }

    fn attach(&self, node: NodeKey) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::Attach(node));
        if !state.attached.insert(node) {
            state.duplicate_attaches += 1;
        }
        Ok(())
    }

    fn detach(&self, node: NodeKey) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::Detach(node));
        if state.fail_detach == Some(node) {
            return Err(EngineError::Render(format!("detach {node} refused")));
        }
        state
            .edges
            .retain(|(from, to)| *from != node && *to != Endpoint::Node(node));
        state.attached.remove(&node);
        Ok(())
    }

    fn is_attached(&self, node: NodeKey) -> bool {
        self.state.lock().attached.contains(&node)
    }

    fn connect(&self, from: NodeKey, to: Endpoint) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::Connect(from, to));
        if state.fail_connect_from == Some(from) {
            return Err(EngineError::Render(format!("connect {from} refused")));
        }
        if !state.attached.contains(&from) {
            return Err(EngineError::Render(format!("{from} is not attached")));
        }
        if let Endpoint::Node(dest) = to {
            if !state.attached.contains(&dest) {
                return Err(EngineError::Render(format!("{dest} is not attached")));
            }
        }
        if !state.edges.insert((from, to)) {
            state.duplicate_connects += 1;
        }
        Ok(())
    }

    fn disconnect_output(&self, node: NodeKey) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::DisconnectOutput(node));
        state.edges.retain(|(from, _)| *from != node);
        Ok(())
    }

    fn disconnect_input(&self, node: NodeKey) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.ops.push(GraphOp::DisconnectInput(node));
        state.edges.retain(|(_, to)| *to != Endpoint::Node(node));
        Ok(())
    }

    fn has_output(&self, node: NodeKey) -> bool {
        self.state.lock().edges.iter().any(|(from, _)| *from == node)
    }

    fn has_input(&self, node: NodeKey) -> bool {
        self.state
            .lock()
            .edges
            .iter()
            .any(|(_, to)| *to == Endpoint::Node(node))
    }

    fn attached_count(&self) -> usize {
        self.state.lock().attached.len()
    }
}

impl fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryGraph")
            .field("running", &state.running)
            .field("attached", &state.attached.len())
            .field("edges", &state.edges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(track: u64, role: NodeRole) -> NodeKey {
        NodeKey::new(TrackId(track), role)
    }

    #[test]
    fn test_connect_requires_attached_nodes() {
        let graph = MemoryGraph::running(StreamFormat::default());
        let eq = key(1, NodeRole::Eq);
        let vol = key(1, NodeRole::Volume);

        assert!(graph.connect(eq, vol.into()).is_err());

        graph.attach(eq).unwrap();
        graph.attach(vol).unwrap();
        graph.connect(eq, vol.into()).unwrap();

        assert!(graph.has_output(eq));
        assert!(graph.has_input(vol));
        assert_eq!(graph.outputs_of(eq), vec![Endpoint::Node(vol)]);
    }

    #[test]
    fn test_disconnect_sides() {
        let graph = MemoryGraph::running(StreamFormat::default());
        let a = key(1, NodeRole::Eq);
        let b = key(1, NodeRole::Volume);
        let c = key(1, NodeRole::Pan);
        for n in [a, b, c] {
            graph.attach(n).unwrap();
        }
        graph.connect(a, b.into()).unwrap();
        graph.connect(b, c.into()).unwrap();
        graph.connect(c, Endpoint::Bus(BusId::MASTER)).unwrap();

        graph.disconnect_output(b).unwrap();
        assert!(graph.has_output(a));
        assert!(!graph.has_input(c));

        graph.detach(a).unwrap();
        assert!(!graph.has_input(b));
        assert_eq!(graph.attached_count(), 2);
        assert_eq!(graph.connection_count(), 1);
    }

    #[test]
    fn test_duplicates_are_counted() {
        let graph = MemoryGraph::running(StreamFormat::default());
        let a = key(2, NodeRole::Pan);
        graph.attach(a).unwrap();
        graph.attach(a).unwrap();
        graph.connect(a, Endpoint::Bus(BusId(3))).unwrap();
        graph.connect(a, Endpoint::Bus(BusId(3))).unwrap();

        assert_eq!(graph.duplicate_attaches(), 1);
        assert_eq!(graph.duplicate_connects(), 1);
        assert_eq!(graph.ops_for(TrackId(2)).len(), 4);
    }

    #[test]
    fn test_start_fault_injection() {
        let graph = MemoryGraph::new(StreamFormat::default());
        graph.fail_starts(1);

        assert!(graph.start().is_err());
        assert!(!graph.is_running());

        graph.delay_start(2);
        graph.start().unwrap();
        assert!(!graph.is_running());
        assert!(!graph.is_running());
        assert!(graph.is_running());
    }
}
