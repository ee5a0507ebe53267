//! Document snapshots and bounded state history

use crate::element::{ElementData, ElementId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Default number of snapshots kept in history
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Summary counters recorded alongside a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    pub element_count: usize,
    pub shape_count: usize,
    pub connection_count: usize,
    /// Elements skipped because they could not be read
    pub skipped: usize,
    pub extraction_ms: u64,
}

/// Immutable canonical snapshot of a diagram model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub timestamp: u64,
    pub version: u64,
    pub client_id: String,
    pub elements: HashMap<ElementId, ElementData>,
    pub metadata: StateMetadata,
}

impl DocumentState {
    /// A state with no elements
    pub fn empty(client_id: impl Into<String>) -> Self {
        Self {
            timestamp: 0,
            version: 0,
            client_id: client_id.into(),
            elements: HashMap::new(),
            metadata: StateMetadata::default(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ElementData> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element-wise equality, ignoring timestamps, versions and bookkeeping fields
    pub fn same_content(&self, other: &DocumentState) -> bool {
        self.elements.len() == other.elements.len()
            && self.elements.iter().all(|(id, el)| {
                other.elements.get(id).map_or(false, |o| {
                    o.element_type == el.element_type
                        && o.kind == el.kind
                        && o.business_object == el.business_object
                        && o.custom_properties == el.custom_properties
                        && o.parent == el.parent
                })
            })
    }
}

/// Bounded ring buffer of past snapshots
#[derive(Debug)]
pub struct StateManager {
    history: VecDeque<Arc<DocumentState>>,
    max_size: usize,
}

impl StateManager {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            history: VecDeque::with_capacity(max_size.min(DEFAULT_HISTORY_SIZE)),
            max_size,
        }
    }

    /// Record a new snapshot, evicting the oldest past capacity
    pub fn record(&mut self, state: DocumentState) -> Arc<DocumentState> {
        let state = Arc::new(state);
        if self.history.len() == self.max_size {
            self.history.pop_front();
        }
        self.history.push_back(state.clone());
        state
    }

    /// The most recently recorded snapshot
    pub fn latest(&self) -> Option<Arc<DocumentState>> {
        self.history.back().cloned()
    }

    /// Find a snapshot by version
    pub fn get(&self, version: u64) -> Option<Arc<DocumentState>> {
        self.history.iter().rev().find(|s| s.version == version).cloned()
    }

    /// Snapshot recorded `steps` entries before the latest
    pub fn previous(&self, steps: usize) -> Option<Arc<DocumentState>> {
        let len = self.history.len();
        if steps >= len {
            return None;
        }
        self.history.get(len - 1 - steps).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DocumentState>> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}
