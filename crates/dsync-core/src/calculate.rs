//! Snapshot comparison: two `DocumentState`s -> `DocumentDiff`

use crate::diff::{Change, DocumentDiff, EndpointDelta, ModifiedElement, WaypointDelta, BatchingHint};
use crate::element::{ElementData, ElementId, Point, PropertyMap, Size};
use crate::state::DocumentState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Default positional tolerance in diagram units
pub const DEFAULT_POSITION_TOLERANCE: f64 = 0.5;

/// Default operation count above which a batching hint is attached
pub const DEFAULT_BATCH_THRESHOLD: usize = 10;

/// Diff calculator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CalculatorConfig {
    pub position_tolerance: f64,
    /// Drop geometric changes smaller than `position_tolerance`
    pub ignore_minor_changes: bool,
    pub batch_threshold: usize,
    /// Suggested sub-batch size carried in the batching hint
    pub batch_size: usize,
    pub enable_optimization: bool,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            position_tolerance: DEFAULT_POSITION_TOLERANCE,
            ignore_minor_changes: true,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            batch_size: 25,
            enable_optimization: true,
        }
    }
}

/// Computes typed differences between snapshots
#[derive(Debug, Clone)]
pub struct DiffCalculator {
    client_id: String,
    config: CalculatorConfig,
}

impl DiffCalculator {
    pub fn new(client_id: impl Into<String>, config: CalculatorConfig) -> Self {
        Self {
            client_id: client_id.into(),
            config,
        }
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    /// Diff `old` against `new`; without `old` every element counts as added
    pub fn calculate(&self, old: Option<&DocumentState>, new: &DocumentState) -> DocumentDiff {
        let from_version = old.map_or(0, |s| s.version);
        let mut diff = DocumentDiff::new(self.client_id.clone(), from_version, new.version);
        let mut removed_types = BTreeMap::new();

        let Some(old) = old else {
            diff.added = dependency_order(new.elements.values().cloned().collect());
            self.finish(&mut diff, &removed_types);
            return diff;
        };

        let mut added = Vec::new();
        let mut ids: Vec<&ElementId> = new.elements.keys().collect();
        ids.sort();
        for id in ids {
            let current = &new.elements[id];
            match old.elements.get(id) {
                None => added.push(current.clone()),
                Some(previous) => {
                    if previous.is_connection() != current.is_connection() {
                        warn!(element_id = %id, "Element switched between shape and connection; skipping");
                        continue;
                    }
                    let changes = self.detect_changes(previous, current);
                    if !changes.is_empty() {
                        diff.modified.push(ModifiedElement {
                            id: id.clone(),
                            changes,
                            current: current.clone(),
                        });
                    }
                }
            }
        }

        let mut removed: Vec<&ElementData> = old
            .elements
            .values()
            .filter(|el| !new.elements.contains_key(&el.id))
            .collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));
        for el in removed {
            removed_types.insert(el.id.clone(), el.element_type.clone());
            diff.removed.push(el.id.clone());
        }

        diff.added = dependency_order(added);
        self.finish(&mut diff, &removed_types);
        diff
    }

    fn finish(&self, diff: &mut DocumentDiff, removed_types: &BTreeMap<ElementId, String>) {
        if self.config.enable_optimization {
            optimize(diff);
        }
        diff.refresh_statistics(removed_types);

        let operations = diff.operation_count();
        if operations > self.config.batch_threshold {
            let batch_size = self.config.batch_size.max(1);
            diff.batching = Some(BatchingHint {
                batch_size,
                batch_count: operations.div_ceil(batch_size),
                priority: diff.priority(),
            });
        }

        if diff.has_changes {
            debug!(
                diff_id = %diff.id,
                added = diff.added.len(),
                modified = diff.modified.len(),
                removed = diff.removed.len(),
                "Calculated diff"
            );
        }
    }

    /// Run every change detector over one element present in both snapshots
    pub fn detect_changes(&self, old: &ElementData, new: &ElementData) -> Vec<Change> {
        let mut changes = Vec::new();

        if let (Some(a), Some(b)) = (old.position(), new.position()) {
            if self.point_changed(&a, &b) {
                changes.push(Change::Position {
                    old: a,
                    new: b,
                    delta: b.delta(&a),
                });
            }
        }

        if let (Some(a), Some(b)) = (old.size(), new.size()) {
            if self.size_changed(&a, &b) {
                changes.push(Change::Size {
                    old: a,
                    new: b,
                    delta: Size::new(b.width - a.width, b.height - a.height),
                });
            }
        }

        if let (Some(a), Some(b)) = (old.waypoints(), new.waypoints()) {
            if let Some(delta) = self.waypoint_delta(a, b) {
                changes.push(Change::Waypoints {
                    old: a.to_vec(),
                    new: b.to_vec(),
                    delta,
                });
            }
        }

        if let Some((old_map, new_map, keys)) = property_changes(&old.business_object, &new.business_object) {
            changes.push(Change::BusinessObject {
                old: old_map,
                new: new_map,
                changed_keys: keys,
            });
        }

        if let (Some((os, ot)), Some((ns, nt))) = (old.endpoints(), new.endpoints()) {
            let delta = EndpointDelta {
                source_changed: os != ns,
                target_changed: ot != nt,
            };
            if delta.source_changed || delta.target_changed {
                changes.push(Change::ConnectionEndpoints {
                    old_source: os.clone(),
                    old_target: ot.clone(),
                    new_source: ns.clone(),
                    new_target: nt.clone(),
                    delta,
                });
            }
        }

        if old.parent != new.parent {
            changes.push(Change::Parent {
                old: old.parent.clone(),
                new: new.parent.clone(),
            });
        }

        if let Some((old_map, new_map, keys)) = property_changes(&old.custom_properties, &new.custom_properties) {
            changes.push(Change::CustomProperties {
                old: old_map,
                new: new_map,
                changed_keys: keys,
            });
        }

        changes
    }

    fn point_changed(&self, a: &Point, b: &Point) -> bool {
        if self.config.ignore_minor_changes {
            !a.within(b, self.config.position_tolerance)
        } else {
            a != b
        }
    }

    fn size_changed(&self, a: &Size, b: &Size) -> bool {
        if self.config.ignore_minor_changes {
            !a.within(b, self.config.position_tolerance)
        } else {
            a != b
        }
    }

    fn waypoint_delta(&self, old: &[Point], new: &[Point]) -> Option<WaypointDelta> {
        let moved = old
            .iter()
            .zip(new.iter())
            .filter(|(a, b)| self.point_changed(a, b))
            .count();
        let delta = WaypointDelta {
            added: new.len().saturating_sub(old.len()),
            removed: old.len().saturating_sub(new.len()),
            moved,
        };
        if delta == WaypointDelta::default() {
            None
        } else {
            Some(delta)
        }
    }
}

/// Changed keys between two property maps, with old/new restricted to those keys
fn property_changes(old: &PropertyMap, new: &PropertyMap) -> Option<(PropertyMap, PropertyMap, Vec<String>)> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let changed: Vec<String> = keys
        .into_iter()
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect();
    if changed.is_empty() {
        return None;
    }
    let pick = |map: &PropertyMap| -> PropertyMap {
        changed
            .iter()
            .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    };
    Some((pick(old), pick(new), changed))
}

/// Remove accidental duplicates and keep `removed` disjoint from the other sets
pub fn optimize(diff: &mut DocumentDiff) {
    let mut seen = HashSet::new();
    let before = diff.added.len();
    let mut deduped: Vec<ElementData> = Vec::with_capacity(before);
    for el in diff.added.drain(..).rev() {
        if seen.insert(el.id.clone()) {
            deduped.push(el);
        }
    }
    deduped.reverse();
    if deduped.len() != before {
        warn!(
            diff_id = %diff.id,
            duplicates = before - deduped.len(),
            "Diff contained duplicate added ids; keeping the latest"
        );
    }
    diff.added = deduped;

    let mut modified: Vec<ModifiedElement> = Vec::with_capacity(diff.modified.len());
    let mut index: HashMap<ElementId, usize> = HashMap::new();
    for entry in diff.modified.drain(..) {
        if seen.contains(&entry.id) {
            warn!(diff_id = %diff.id, element_id = %entry.id, "Element both added and modified; dropping modification");
            continue;
        }
        match index.get(&entry.id) {
            Some(&i) => {
                warn!(diff_id = %diff.id, element_id = %entry.id, "Duplicate modified entry; merging");
                let merged = &mut modified[i];
                for change in entry.changes {
                    merged.changes.retain(|c| c.kind() != change.kind());
                    merged.changes.push(change);
                }
                merged.current = entry.current;
            }
            None => {
                index.insert(entry.id.clone(), modified.len());
                modified.push(entry);
            }
        }
    }
    diff.modified = modified;

    let mut removed_seen = HashSet::new();
    let touched: HashSet<ElementId> = seen.into_iter().chain(index.into_keys()).collect();
    diff.removed.retain(|id| {
        if touched.contains(id) {
            warn!(element_id = %id, "Element both removed and added/modified; dropping removal");
            return false;
        }
        removed_seen.insert(id.clone())
    });
}

/// Order elements so parents, sources and targets precede their dependents.
///
/// Depth-first topological sort; shapes are visited before connections and
/// back edges of a cycle are ignored rather than failing the sort.
pub fn dependency_order(elements: Vec<ElementData>) -> Vec<ElementData> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut by_id: HashMap<ElementId, ElementData> = HashMap::with_capacity(elements.len());
    for el in elements {
        by_id.insert(el.id.clone(), el);
    }

    let priority = |id: &ElementId, by_id: &HashMap<ElementId, ElementData>| {
        (by_id.get(id).map_or(false, |e| e.is_connection()), id.clone())
    };
    let mut roots: Vec<ElementId> = by_id.keys().cloned().collect();
    roots.sort_by_key(|id| priority(id, &by_id));

    let mut marks: HashMap<ElementId, Mark> = HashMap::with_capacity(by_id.len());
    let mut order: Vec<ElementId> = Vec::with_capacity(by_id.len());
    let mut stack: Vec<(ElementId, bool)> = Vec::new();

    for root in roots {
        if marks.contains_key(&root) {
            continue;
        }
        stack.push((root, false));
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                marks.insert(id.clone(), Mark::Done);
                order.push(id);
                continue;
            }
            if marks.contains_key(&id) {
                continue;
            }
            marks.insert(id.clone(), Mark::Visiting);
            stack.push((id.clone(), true));

            let mut deps: Vec<ElementId> = by_id[&id]
                .dependencies()
                .filter(|d| by_id.contains_key(*d))
                .cloned()
                .collect();
            // Reverse priority so the highest-priority dependency is popped first
            deps.sort_by_key(|d| std::cmp::Reverse(priority(d, &by_id)));
            for dep in deps {
                match marks.get(&dep) {
                    None => stack.push((dep, false)),
                    Some(Mark::Visiting) => {
                        debug!(element_id = %id, dependency = %dep, "Dependency cycle; falling back to type priority");
                    }
                    Some(Mark::Done) => {}
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMetadata;

    fn state(version: u64, elements: Vec<ElementData>) -> DocumentState {
        DocumentState {
            timestamp: 0,
            version,
            client_id: "a".into(),
            elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
            metadata: StateMetadata::default(),
        }
    }

    fn task(id: &str, x: f64, y: f64) -> ElementData {
        ElementData::shape(id, "Task", Point::new(x, y), Size::new(100.0, 80.0))
    }

    fn calculator() -> DiffCalculator {
        DiffCalculator::new("a", CalculatorConfig::default())
    }

    #[test]
    fn test_bootstrap_adds_everything() {
        let new = state(1, vec![task("s1", 0.0, 0.0), task("s2", 0.0, 0.0)]);
        let diff = calculator().calculate(None, &new);
        assert!(diff.has_changes);
        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.from_version, 0);
        assert_eq!(diff.to_version, 1);
    }

    #[test]
    fn test_sub_tolerance_move_is_ignored() {
        let old = state(1, vec![task("s1", 10.0, 10.0)]);
        let jitter = state(2, vec![task("s1", 10.2, 10.1)]);
        let diff = calculator().calculate(Some(&old), &jitter);
        assert!(!diff.has_changes);
        assert!(diff.modified.is_empty());

        let moved = state(3, vec![task("s1", 20.0, 20.0)]);
        let diff = calculator().calculate(Some(&old), &moved);
        assert!(diff.has_changes);
        assert_eq!(diff.modified.len(), 1);
        match &diff.modified[0].changes[0] {
            Change::Position { delta, .. } => assert_eq!(*delta, Point::new(10.0, 10.0)),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_tolerance_boundary() {
        let old = state(1, vec![task("s1", 0.0, 0.0)]);
        let at_tolerance = state(2, vec![task("s1", 0.5, 0.0)]);
        let diff = calculator().calculate(Some(&old), &at_tolerance);
        assert_eq!(diff.modified.len(), 1);

        let strict = DiffCalculator::new(
            "a",
            CalculatorConfig {
                ignore_minor_changes: false,
                ..Default::default()
            },
        );
        let tiny = state(2, vec![task("s1", 0.1, 0.0)]);
        assert!(strict.calculate(Some(&old), &tiny).has_changes);
    }

    #[test]
    fn test_added_removed_and_property_keys() {
        let old = state(
            1,
            vec![task("s1", 0.0, 0.0).with_property("name", "A").with_property("owner", "x"), task("gone", 0.0, 0.0)],
        );
        let new = state(
            2,
            vec![task("s1", 0.0, 0.0).with_property("name", "B"), task("fresh", 0.0, 0.0)],
        );
        let diff = calculator().calculate(Some(&old), &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed, vec![ElementId::from("gone")]);
        match &diff.modified[0].changes[0] {
            Change::BusinessObject { changed_keys, new, .. } => {
                assert_eq!(changed_keys, &vec!["name".to_string(), "owner".to_string()]);
                assert_eq!(new.get("name"), Some(&serde_json::Value::from("B")));
                assert!(new.get("owner").is_none());
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_parent_and_waypoint_detectors() {
        let old = state(
            1,
            vec![ElementData::connection("c1", "Flow", "s1", "s2", vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)])],
        );
        let new = state(
            2,
            vec![ElementData::connection(
                "c1",
                "Flow",
                "s1",
                "s3",
                vec![Point::new(0.0, 0.0), Point::new(10.0, 5.0), Point::new(20.0, 5.0)],
            )
            .with_parent("lane")],
        );
        let diff = calculator().calculate(Some(&old), &new);
        let entry = &diff.modified[0];
        assert!(entry.has(crate::diff::ChangeKind::Waypoints));
        assert!(entry.has(crate::diff::ChangeKind::ConnectionEndpoints));
        assert!(entry.has(crate::diff::ChangeKind::Parent));
        for change in &entry.changes {
            if let Change::Waypoints { delta, .. } = change {
                assert_eq!(delta.added, 1);
                assert_eq!(delta.moved, 1);
            }
            if let Change::ConnectionEndpoints { delta, .. } = change {
                assert!(!delta.source_changed);
                assert!(delta.target_changed);
            }
        }
    }

    #[test]
    fn test_dependency_order() {
        let elements = vec![
            ElementData::connection("a_conn", "Flow", "z_src", "child", vec![]),
            task("child", 0.0, 0.0).with_parent("pool"),
            task("z_src", 0.0, 0.0),
            task("pool", 0.0, 0.0),
        ];
        let ordered: Vec<String> = dependency_order(elements)
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        let pos = |id: &str| ordered.iter().position(|x| x == id).unwrap();
        assert!(pos("pool") < pos("child"));
        assert!(pos("child") < pos("a_conn"));
        assert!(pos("z_src") < pos("a_conn"));
    }

    #[test]
    fn test_dependency_cycle_does_not_fail() {
        let elements = vec![
            task("a", 0.0, 0.0).with_parent("b"),
            task("b", 0.0, 0.0).with_parent("a"),
            ElementData::connection("c", "Flow", "a", "b", vec![]),
        ];
        let ordered = dependency_order(elements);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered.last().unwrap().id.as_str(), "c");
    }

    #[test]
    fn test_batching_hint() {
        let new = state(1, (0..12).map(|i| task(&format!("s{}", i), 0.0, 0.0)).collect());
        let diff = calculator().calculate(None, &new);
        let hint = diff.batching.unwrap();
        assert_eq!(hint.batch_count, 1);
        assert_eq!(hint.priority, crate::diff::DiffPriority::Structural);

        let small = state(1, vec![task("s1", 0.0, 0.0)]);
        assert!(calculator().calculate(None, &small).batching.is_none());
    }

    #[test]
    fn test_optimize_removes_duplicates() {
        let mut diff = DocumentDiff::new("a", 0, 1);
        diff.added = vec![task("s1", 0.0, 0.0), task("s1", 5.0, 5.0)];
        diff.removed = vec!["s1".into(), "s2".into(), "s2".into()];
        optimize(&mut diff);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].position(), Some(Point::new(5.0, 5.0)));
        assert_eq!(diff.removed, vec![ElementId::from("s2")]);
    }
}
