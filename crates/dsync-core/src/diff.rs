//! Diff types exchanged between replicas

use crate::element::{ElementData, ElementId, Point, PropertyMap, PropertyPatch, Size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many waypoints were added, removed or moved between two paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WaypointDelta {
    pub added: usize,
    pub removed: usize,
    pub moved: usize,
}

/// Which connection endpoints changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDelta {
    pub source_changed: bool,
    pub target_changed: bool,
}

/// One semantically typed change to an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Change {
    Position {
        old: Point,
        new: Point,
        delta: Point,
    },
    Size {
        old: Size,
        new: Size,
        delta: Size,
    },
    Waypoints {
        old: Vec<Point>,
        new: Vec<Point>,
        delta: WaypointDelta,
    },
    /// Only the changed keys are carried; a key absent from `new` was removed
    #[serde(rename_all = "camelCase")]
    BusinessObject {
        old: PropertyMap,
        new: PropertyMap,
        changed_keys: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionEndpoints {
        old_source: ElementId,
        old_target: ElementId,
        new_source: ElementId,
        new_target: ElementId,
        delta: EndpointDelta,
    },
    Parent {
        old: Option<ElementId>,
        new: Option<ElementId>,
    },
    #[serde(rename_all = "camelCase")]
    CustomProperties {
        old: PropertyMap,
        new: PropertyMap,
        changed_keys: Vec<String>,
    },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Position { .. } => ChangeKind::Position,
            Change::Size { .. } => ChangeKind::Size,
            Change::Waypoints { .. } => ChangeKind::Waypoints,
            Change::BusinessObject { .. } => ChangeKind::BusinessObject,
            Change::ConnectionEndpoints { .. } => ChangeKind::ConnectionEndpoints,
            Change::Parent { .. } => ChangeKind::Parent,
            Change::CustomProperties { .. } => ChangeKind::CustomProperties,
        }
    }

    /// Property patch for `BusinessObject` and `CustomProperties` changes
    pub fn patch(&self) -> Option<PropertyPatch> {
        match self {
            Change::BusinessObject { new, changed_keys, .. }
            | Change::CustomProperties { new, changed_keys, .. } => Some(
                changed_keys
                    .iter()
                    .map(|k| (k.clone(), new.get(k).cloned()))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// The part of this change that `touched` also changes: the same kind
    /// and, for property changes, only the keys both carry
    pub fn narrowed_to(self, touched: &[Change]) -> Option<Change> {
        let peer = touched.iter().find(|t| t.kind() == self.kind())?;
        match (self, peer) {
            (
                Change::BusinessObject { old, new, changed_keys },
                Change::BusinessObject { changed_keys: keep, .. },
            ) => narrow_keys(old, new, changed_keys, keep)
                .map(|(old, new, changed_keys)| Change::BusinessObject { old, new, changed_keys }),
            (
                Change::CustomProperties { old, new, changed_keys },
                Change::CustomProperties { changed_keys: keep, .. },
            ) => narrow_keys(old, new, changed_keys, keep)
                .map(|(old, new, changed_keys)| Change::CustomProperties { old, new, changed_keys }),
            (change, _) => Some(change),
        }
    }
}

fn narrow_keys(
    mut old: PropertyMap,
    mut new: PropertyMap,
    mut changed: Vec<String>,
    keep: &[String],
) -> Option<(PropertyMap, PropertyMap, Vec<String>)> {
    changed.retain(|k| keep.contains(k));
    if changed.is_empty() {
        return None;
    }
    old.retain(|k, _| changed.contains(k));
    new.retain(|k, _| changed.contains(k));
    Some((old, new, changed))
}

/// Change discriminant, used for statistics and prioritisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Position,
    Size,
    Waypoints,
    BusinessObject,
    ConnectionEndpoints,
    Parent,
    CustomProperties,
}

impl ChangeKind {
    pub fn priority(&self) -> DiffPriority {
        match self {
            ChangeKind::Parent => DiffPriority::Structural,
            ChangeKind::ConnectionEndpoints | ChangeKind::Waypoints => DiffPriority::Connection,
            ChangeKind::BusinessObject | ChangeKind::CustomProperties => DiffPriority::Semantic,
            ChangeKind::Position | ChangeKind::Size => DiffPriority::Visual,
        }
    }
}

/// Coarse priority of a diff; declared lowest first so `Ord` ranks structural highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffPriority {
    Visual,
    Semantic,
    Connection,
    Structural,
}

/// An element present in both snapshots with at least one change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedElement {
    pub id: ElementId,
    pub changes: Vec<Change>,
    /// The element as it looks after the changes
    pub current: ElementData,
}

impl ModifiedElement {
    pub fn has(&self, kind: ChangeKind) -> bool {
        self.changes.iter().any(|c| c.kind() == kind)
    }
}

/// Per element-type counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeStatistics {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

/// Counters describing a diff
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStatistics {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub total_changes: usize,
    pub by_type: BTreeMap<String, TypeStatistics>,
    pub by_change: BTreeMap<ChangeKind, usize>,
}

/// Suggested sub-batching for large diffs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchingHint {
    pub batch_size: usize,
    pub batch_count: usize,
    pub priority: DiffPriority,
}

/// Minimal structured difference between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDiff {
    pub id: String,
    pub timestamp: u64,
    pub client_id: String,
    pub from_version: u64,
    pub to_version: u64,
    /// Dependency-sorted: parents and endpoints come first
    pub added: Vec<ElementData>,
    pub modified: Vec<ModifiedElement>,
    pub removed: Vec<ElementId>,
    pub has_changes: bool,
    #[serde(default)]
    pub statistics: DiffStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingHint>,
}

impl DocumentDiff {
    pub fn new(client_id: impl Into<String>, from_version: u64, to_version: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::element::now_millis(),
            client_id: client_id.into(),
            from_version,
            to_version,
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
            has_changes: false,
            statistics: DiffStatistics::default(),
            batching: None,
        }
    }

    /// Number of element-level operations (adds, modifications, removals)
    pub fn operation_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Number of individual changes, counting each add and removal as one
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.iter().map(|m| m.changes.len()).sum::<usize>()
    }

    /// Every element id this diff touches
    pub fn touched_ids(&self) -> impl Iterator<Item = &ElementId> {
        self.added
            .iter()
            .map(|e| &e.id)
            .chain(self.modified.iter().map(|m| &m.id))
            .chain(self.removed.iter())
    }

    /// Recompute `has_changes` and `statistics` from the current contents
    pub fn refresh_statistics(&mut self, removed_types: &BTreeMap<ElementId, String>) {
        let mut stats = DiffStatistics {
            added: self.added.len(),
            modified: self.modified.len(),
            removed: self.removed.len(),
            ..Default::default()
        };
        for el in &self.added {
            stats.by_type.entry(el.element_type.clone()).or_default().added += 1;
        }
        for m in &self.modified {
            stats.by_type.entry(m.current.element_type.clone()).or_default().modified += 1;
            for change in &m.changes {
                *stats.by_change.entry(change.kind()).or_default() += 1;
            }
        }
        for id in &self.removed {
            let ty = removed_types.get(id).cloned().unwrap_or_else(|| "unknown".into());
            stats.by_type.entry(ty).or_default().removed += 1;
        }
        stats.total_changes = self.change_count();
        self.has_changes = self.operation_count() > 0;
        self.statistics = stats;
    }

    /// Highest priority among the operations in this diff
    pub fn priority(&self) -> DiffPriority {
        if !self.added.is_empty() || !self.removed.is_empty() {
            return DiffPriority::Structural;
        }
        self.modified
            .iter()
            .flat_map(|m| m.changes.iter().map(|c| c.kind().priority()))
            .max()
            .unwrap_or(DiffPriority::Visual)
    }
}
