use crate::core::models::variable::{Shape, VarKind};
use crate::core::registry::VariableRegistry;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotEvent {
    Compute,
    Linearize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableSnapshot {
    pub path: String,
    pub promoted: String,
    pub kind: VarKind,
    pub shape: Shape,
    /// `None` for an output nothing has computed or set yet.
    pub value: Option<Vec<f64>>,
}

/// The state of every variable after one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub event: SnapshotEvent,
    /// Running count of passes of this kind, starting at 1.
    pub pass: usize,
    pub rank: usize,
    pub variables: Vec<VariableSnapshot>,
}

impl Snapshot {
    pub(crate) fn capture(
        registry: &VariableRegistry,
        event: SnapshotEvent,
        pass: usize,
        rank: usize,
    ) -> Self {
        let variables = registry
            .declared()
            .iter()
            .filter_map(|&id| registry.get(id).map(|var| (id, var)))
            .map(|(id, var)| VariableSnapshot {
                path: var.path.clone(),
                promoted: var.promoted.clone(),
                kind: var.kind,
                shape: var.shape.clone(),
                value: registry
                    .is_initialized(id)
                    .then(|| registry.value(id).to_vec()),
            })
            .collect();
        Self {
            event,
            pass,
            rank,
            variables,
        }
    }

    pub fn variable(&self, path: &str) -> Option<&VariableSnapshot> {
        self.variables.iter().find(|v| v.path == path)
    }
}

/// Receives a snapshot after every compute and linearize pass.
pub trait Recorder: Send {
    fn record(&mut self, snapshot: &Snapshot);
}

/// Keeps every snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    snapshots: Vec<Snapshot>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, snapshot: &Snapshot) {
        self.snapshots.push(snapshot.clone());
    }
}

impl<R: Recorder + ?Sized> Recorder for std::sync::Arc<std::sync::Mutex<R>> {
    fn record(&mut self, snapshot: &Snapshot) {
        let mut guard = self.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.record(snapshot);
    }
}
