//! Replaying a `DocumentDiff` onto a live model

use crate::calculate::{dependency_order, CalculatorConfig, DiffCalculator};
use crate::diff::{Change, DocumentDiff, ModifiedElement};
use crate::element::{ElementData, ElementId, ElementKind, Point, Size};
use crate::error::{ErrorCode, ModelError, Operation, OperationError, SyncWarning};
use crate::extract::{ExtractorConfig, StateExtractor};
use crate::model::{ConnectionSpec, DiagramModel, ShapeSpec};
use crate::state::DocumentState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Size given to shapes added without one
pub const DEFAULT_SHAPE_SIZE: Size = Size {
    width: 100.0,
    height: 80.0,
};

/// Diff applicator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicatorConfig {
    /// Operations per sub-batch
    pub batch_size: usize,
    /// Revert the whole call when an unrecoverable error occurs
    pub rollback_on_error: bool,
    /// Retries for connections whose endpoints are not yet present
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ApplicatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            rollback_on_error: true,
            max_retries: 1,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Outcome of applying a diff (or retrying deferred work)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub diff_id: Option<String>,
    pub applied_changes: usize,
    pub errors: Vec<OperationError>,
    pub warnings: Vec<SyncWarning>,
    pub rolled_back: bool,
    /// Connections queued for a delayed retry
    pub deferred: usize,
    pub duration_ms: u64,
}

impl SyncResult {
    /// A successful result with nothing applied
    pub fn empty(diff_id: Option<String>) -> Self {
        Self {
            success: true,
            diff_id,
            ..Default::default()
        }
    }

    fn failed(diff_id: &str, errors: Vec<OperationError>) -> Self {
        Self {
            success: false,
            diff_id: Some(diff_id.to_string()),
            errors,
            ..Default::default()
        }
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: SyncResult) {
        self.success &= other.success;
        self.applied_changes += other.applied_changes;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.rolled_back |= other.rolled_back;
        self.deferred += other.deferred;
        self.duration_ms += other.duration_ms;
    }
}

/// A connection waiting for its endpoints
#[derive(Debug, Clone)]
struct PendingConnection {
    element: ElementData,
    diff_id: String,
    attempts: u32,
    due: Instant,
}

enum Step<'a> {
    Remove(ElementId),
    Add(ElementData),
    Modify(&'a ModifiedElement),
}

enum Outcome {
    Applied(usize),
    Skipped(SyncWarning),
    Deferred(SyncWarning),
    Failed(OperationError),
}

/// Applies diffs through the model's own mutation primitives
#[derive(Debug)]
pub struct DiffApplicator {
    config: ApplicatorConfig,
    snapshotter: StateExtractor,
    reverter: DiffCalculator,
    pending: Vec<PendingConnection>,
}

impl DiffApplicator {
    pub fn new(client_id: impl Into<String>, config: ApplicatorConfig) -> Self {
        let client_id = client_id.into();
        let exact = CalculatorConfig {
            ignore_minor_changes: false,
            position_tolerance: 0.0,
            ..Default::default()
        };
        Self {
            config,
            snapshotter: StateExtractor::new(client_id.clone(), ExtractorConfig::default()),
            reverter: DiffCalculator::new(client_id, exact),
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &ApplicatorConfig {
        &self.config
    }

    /// Apply `diff` to `model`.
    ///
    /// Validation failures abort before any mutation. With rollback enabled,
    /// the first unrecoverable error reverts everything this call applied.
    pub fn apply<M: DiagramModel + ?Sized>(&mut self, diff: &DocumentDiff, model: &mut M) -> SyncResult {
        let started = std::time::Instant::now();

        if let Err(errors) = validate(diff) {
            warn!(diff_id = %diff.id, errors = errors.len(), "Rejecting malformed diff");
            return SyncResult::failed(&diff.id, errors);
        }
        if diff.operation_count() == 0 {
            return SyncResult::empty(Some(diff.id.clone()));
        }

        let plan = self.plan(diff, &*model);
        let backup = if self.config.rollback_on_error {
            Some(self.snapshotter.extract(&*model))
        } else {
            None
        };
        let pending_before = self.pending.len();

        let mut result = SyncResult::empty(Some(diff.id.clone()));
        let batch_size = self.config.batch_size.max(1);
        let batches = plan.len().div_ceil(batch_size);
        let mut abort = false;

        'batches: for (index, batch) in plan.chunks(batch_size).enumerate() {
            debug!(diff_id = %diff.id, batch = index + 1, of = batches, size = batch.len(), "Applying batch");
            for step in batch {
                match self.execute(step, &diff.id, model) {
                    Outcome::Applied(n) => result.applied_changes += n,
                    Outcome::Skipped(w) => {
                        debug!(diff_id = %diff.id, warning = %w.message, "Skipped operation");
                        result.warnings.push(w);
                    }
                    Outcome::Deferred(w) => {
                        result.deferred += 1;
                        result.warnings.push(w);
                    }
                    Outcome::Failed(e) => {
                        warn!(diff_id = %diff.id, error = %e, "Operation failed");
                        let fatal = !e.recoverable && backup.is_some();
                        result.errors.push(e);
                        if fatal {
                            abort = true;
                            break 'batches;
                        }
                    }
                }
            }
        }

        if abort {
            if let Some(backup) = backup {
                self.pending.truncate(pending_before);
                result.deferred = 0;
                let reverted = self.rollback(&backup, model);
                match reverted {
                    Ok(count) => {
                        error!(diff_id = %diff.id, reverted = count, "Rolled back diff after failure");
                    }
                    Err(errors) => {
                        error!(diff_id = %diff.id, failures = errors.len(), "Rollback incomplete");
                        result.errors.extend(errors);
                    }
                }
                result.rolled_back = true;
                result.applied_changes = 0;
            }
        }

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            diff_id = %diff.id,
            applied = result.applied_changes,
            warnings = result.warnings.len(),
            errors = result.errors.len(),
            rolled_back = result.rolled_back,
            "Applied diff"
        );
        result
    }

    /// Removals (connections, then deepest shapes first), sorted additions, modifications
    fn plan<'a, M: DiagramModel + ?Sized>(&self, diff: &'a DocumentDiff, model: &M) -> Vec<Step<'a>> {
        let mut removals: Vec<(bool, usize, ElementId)> = diff
            .removed
            .iter()
            .map(|id| {
                let is_shape = model.element(id.as_str()).map_or(true, |el| !el.is_connection());
                (is_shape, depth(model, id), id.clone())
            })
            .collect();
        removals.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        let mut plan: Vec<Step<'a>> = removals.into_iter().map(|(_, _, id)| Step::Remove(id)).collect();
        plan.extend(dependency_order(diff.added.clone()).into_iter().map(Step::Add));
        plan.extend(diff.modified.iter().map(Step::Modify));
        plan
    }

    fn execute<M: DiagramModel + ?Sized>(&mut self, step: &Step<'_>, diff_id: &str, model: &mut M) -> Outcome {
        match step {
            Step::Remove(id) => remove(model, id),
            Step::Add(el) => self.add(el, diff_id, model, true),
            Step::Modify(entry) => modify(model, entry),
        }
    }

    fn add<M: DiagramModel + ?Sized>(&mut self, el: &ElementData, diff_id: &str, model: &mut M, defer: bool) -> Outcome {
        if model.contains(el.id.as_str()) {
            return Outcome::Skipped(SyncWarning::skipped(Operation::Add, &el.id, "element already exists"));
        }
        if let Some(parent) = &el.parent {
            if !model.contains(parent.as_str()) {
                return Outcome::Skipped(SyncWarning::not_found(
                    Operation::Add,
                    &el.id,
                    format!("parent {} not found", parent),
                ));
            }
        }

        let result = match &el.kind {
            ElementKind::Shape { position, size } => model.create_shape(ShapeSpec {
                id: el.id.clone(),
                element_type: el.element_type.clone(),
                properties: el.business_object.clone(),
                custom_properties: el.custom_properties.clone(),
                position: position.unwrap_or_default(),
                size: size.unwrap_or(DEFAULT_SHAPE_SIZE),
                parent: el.parent.clone(),
            }),
            ElementKind::Connection {
                source,
                target,
                waypoints,
            } => {
                let missing: Vec<&ElementId> = [source, target]
                    .into_iter()
                    .filter(|id| !model.contains(id.as_str()))
                    .collect();
                if !missing.is_empty() {
                    let message = format!(
                        "endpoint {} not found",
                        missing.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
                    );
                    if defer && self.config.max_retries > 0 {
                        self.defer(el.clone(), diff_id);
                        return Outcome::Deferred(SyncWarning::not_found(Operation::Add, &el.id, message));
                    }
                    return Outcome::Skipped(SyncWarning::not_found(Operation::Add, &el.id, message));
                }
                let waypoints = match waypoints {
                    Some(points) if !points.is_empty() => points.clone(),
                    _ => fallback_path(&*model, source, target),
                };
                model.create_connection(ConnectionSpec {
                    id: el.id.clone(),
                    element_type: el.element_type.clone(),
                    properties: el.business_object.clone(),
                    custom_properties: el.custom_properties.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    waypoints,
                    parent: el.parent.clone(),
                })
            }
        };

        match result {
            Ok(()) => Outcome::Applied(1),
            Err(ModelError::AlreadyExists(_)) => {
                Outcome::Skipped(SyncWarning::skipped(Operation::Add, &el.id, "element already exists"))
            }
            Err(ModelError::NotFound(missing)) => Outcome::Skipped(SyncWarning::not_found(
                Operation::Add,
                &el.id,
                format!("{} not found", missing),
            )),
            Err(e) => Outcome::Failed(OperationError::from_model(&e, Operation::Add, &el.id)),
        }
    }

    fn defer(&mut self, element: ElementData, diff_id: &str) {
        debug!(element_id = %element.id, delay_ms = self.config.retry_delay.as_millis() as u64, "Deferring connection");
        self.pending.retain(|p| p.element.id != element.id);
        self.pending.push(PendingConnection {
            element,
            diff_id: diff_id.to_string(),
            attempts: 0,
            due: Instant::now() + self.config.retry_delay,
        });
    }

    /// Retry deferred connections that are due.
    ///
    /// A connection whose endpoints are still missing after `max_retries`
    /// retries is dropped with a warning.
    pub fn retry_pending<M: DiagramModel + ?Sized>(&mut self, model: &mut M) -> SyncResult {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.due <= now);
        self.pending = waiting;

        let mut result = SyncResult::empty(None);
        for mut item in due {
            item.attempts += 1;
            match self.add(&item.element, &item.diff_id, model, false) {
                Outcome::Applied(n) => {
                    info!(element_id = %item.element.id, attempts = item.attempts, "Deferred connection applied");
                    result.applied_changes += n;
                }
                Outcome::Skipped(w) if w.code == ErrorCode::NotFound => {
                    if item.attempts >= self.config.max_retries {
                        warn!(
                            element_id = %item.element.id,
                            diff_id = %item.diff_id,
                            "Dropping connection with unresolved endpoints"
                        );
                        result.warnings.push(SyncWarning::not_found(
                            Operation::Retry,
                            &item.element.id,
                            format!("dropped after {} retries: {}", item.attempts, w.message),
                        ));
                    } else {
                        item.due = now + self.config.retry_delay;
                        result.deferred += 1;
                        self.pending.push(item);
                    }
                }
                Outcome::Skipped(w) | Outcome::Deferred(w) => result.warnings.push(w),
                Outcome::Failed(mut e) => {
                    e.operation = Operation::Retry;
                    result.errors.push(e);
                }
            }
        }
        result.success = result.errors.is_empty();
        result
    }

    /// When the next deferred connection becomes due
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.due).min()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all deferred work
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Bring `model` back to `backup` through the mutation primitives
    fn rollback<M: DiagramModel + ?Sized>(
        &mut self,
        backup: &DocumentState,
        model: &mut M,
    ) -> Result<usize, Vec<OperationError>> {
        let current = self.snapshotter.extract(&*model);
        let revert = self.reverter.calculate(Some(&current), backup);
        let plan = self.plan(&revert, &*model);

        let mut applied = 0;
        let mut errors = Vec::new();
        for step in &plan {
            match self.execute(step, &revert.id, model) {
                Outcome::Applied(n) => applied += n,
                Outcome::Skipped(_) => {}
                Outcome::Deferred(w) => {
                    errors.push(OperationError::new(ErrorCode::NotFound, Operation::Rollback, w.message))
                }
                Outcome::Failed(mut e) => {
                    e.operation = Operation::Rollback;
                    errors.push(e);
                }
            }
        }
        // Anything deferred while reverting is not retried
        self.pending.retain(|p| p.diff_id != revert.id);

        if errors.is_empty() {
            Ok(applied)
        } else {
            Err(errors)
        }
    }
}

fn remove<M: DiagramModel + ?Sized>(model: &mut M, id: &ElementId) -> Outcome {
    if !model.contains(id.as_str()) {
        return Outcome::Skipped(SyncWarning::not_found(Operation::Remove, id, "element already removed"));
    }
    match model.remove(id.as_str()) {
        Ok(()) => Outcome::Applied(1),
        Err(ModelError::NotFound(_)) => {
            Outcome::Skipped(SyncWarning::not_found(Operation::Remove, id, "element already removed"))
        }
        Err(e) => Outcome::Failed(OperationError::from_model(&e, Operation::Remove, id)),
    }
}

fn modify<M: DiagramModel + ?Sized>(model: &mut M, entry: &ModifiedElement) -> Outcome {
    let id = &entry.id;
    if !model.contains(id.as_str()) {
        return Outcome::Skipped(SyncWarning::not_found(
            Operation::Modify,
            id,
            "target no longer exists",
        ));
    }

    // Structural changes first so geometry lands in the right container
    let mut changes: Vec<&Change> = entry.changes.iter().collect();
    changes.sort_by_key(|c| std::cmp::Reverse(c.kind().priority()));

    let mut applied = 0;
    for change in changes {
        let outcome = match change {
            Change::Position { new, .. } => model.move_to(id.as_str(), *new),
            Change::Size { new, .. } => model.resize(id.as_str(), *new),
            Change::Waypoints { new, .. } => model.update_waypoints(id.as_str(), new),
            Change::BusinessObject { .. } => match change.patch() {
                Some(patch) => model.update_properties(id.as_str(), &patch),
                None => Ok(()),
            },
            Change::CustomProperties { .. } => match change.patch() {
                Some(patch) => model.update_custom_properties(id.as_str(), &patch),
                None => Ok(()),
            },
            Change::ConnectionEndpoints {
                new_source, new_target, ..
            } => model.reconnect(id.as_str(), new_source, new_target),
            Change::Parent { new, .. } => model.set_parent(id.as_str(), new.as_ref()),
        };
        match outcome {
            Ok(()) => applied += 1,
            Err(ModelError::NotFound(missing)) => {
                // A referenced element vanished concurrently; the rest of the entry still applies
                warn!(element_id = %id, missing = %missing, change = ?change.kind(), "Skipping change");
            }
            Err(e) => return Outcome::Failed(OperationError::from_model(&e, Operation::Modify, id)),
        }
    }
    Outcome::Applied(applied)
}

/// Check the diff's shape before touching the model
pub fn validate(diff: &DocumentDiff) -> Result<(), Vec<OperationError>> {
    let mut errors = Vec::new();
    if diff.id.is_empty() {
        errors.push(OperationError::validation("diff has no id"));
    }

    let mut added = HashSet::new();
    for el in &diff.added {
        if let Err(reason) = el.validate() {
            errors.push(OperationError::validation(reason).with_element(el.id.clone()));
        }
        if !added.insert(&el.id) {
            errors.push(OperationError::validation("element added twice").with_element(el.id.clone()));
        }
    }

    let mut modified = HashSet::new();
    for entry in &diff.modified {
        if entry.id.is_empty() || entry.id != entry.current.id {
            errors.push(OperationError::validation("modified entry id mismatch").with_element(entry.id.clone()));
        }
        if !modified.insert(&entry.id) {
            errors.push(OperationError::validation("element modified twice").with_element(entry.id.clone()));
        }
        if entry.changes.is_empty() {
            errors.push(OperationError::validation("modified entry has no changes").with_element(entry.id.clone()));
        }
        let connection = entry.current.is_connection();
        for change in &entry.changes {
            let fits = match change {
                Change::Position { new, .. } => !connection && new.is_finite(),
                Change::Size { new, .. } => !connection && new.is_finite(),
                Change::Waypoints { new, .. } => connection && new.iter().all(Point::is_finite),
                Change::ConnectionEndpoints { .. } => connection,
                _ => true,
            };
            if !fits {
                errors.push(
                    OperationError::validation(format!("{:?} change does not fit element", change.kind()))
                        .with_element(entry.id.clone()),
                );
            }
        }
    }

    for id in &diff.removed {
        if id.is_empty() {
            errors.push(OperationError::validation("removed id is empty"));
        } else if added.contains(id) || modified.contains(id) {
            errors.push(OperationError::validation("element removed and changed in one diff").with_element(id.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Nesting depth of `id` in the model's containment tree
fn depth<M: DiagramModel + ?Sized>(model: &M, id: &ElementId) -> usize {
    let mut depth = 0;
    let mut current = model.element(id.as_str()).and_then(|el| el.parent);
    let mut seen = HashSet::new();
    while let Some(parent) = current {
        if !seen.insert(parent.clone()) {
            break;
        }
        depth += 1;
        current = model.element(parent.as_str()).and_then(|el| el.parent);
    }
    depth
}

/// Straight center-to-center path between two shapes
fn fallback_path<M: DiagramModel + ?Sized>(model: &M, source: &ElementId, target: &ElementId) -> Vec<Point> {
    let center = |id: &ElementId| model.element(id.as_str()).and_then(|el| el.center());
    center(source).into_iter().chain(center(target)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculate::DiffCalculator;
    use crate::model::MemoryModel;

    fn task(id: &str, x: f64) -> ElementData {
        ElementData::shape(id, "Task", Point::new(x, 0.0), Size::new(100.0, 80.0))
    }

    fn diff_adding(elements: Vec<ElementData>) -> DocumentDiff {
        let mut diff = DocumentDiff::new("remote", 0, 1);
        diff.added = elements;
        diff.has_changes = true;
        diff
    }

    fn extract(model: &MemoryModel) -> DocumentState {
        StateExtractor::new("t", ExtractorConfig::default()).extract(model)
    }

    fn source_model() -> MemoryModel {
        let mut model = MemoryModel::new();
        let mut applicator = DiffApplicator::new("src", ApplicatorConfig::default());
        let diff = diff_adding(vec![
            task("pool", 0.0),
            task("s1", 10.0).with_parent("pool").with_property("name", "Review"),
            task("s2", 300.0).with_parent("pool"),
            ElementData::connection("c1", "SequenceFlow", "s1", "s2", vec![Point::new(110.0, 40.0), Point::new(300.0, 40.0)]),
        ]);
        assert!(applicator.apply(&diff, &mut model).success);
        model
    }

    #[test]
    fn test_round_trip_into_empty_model() {
        let source = source_model();
        let original = extract(&source);
        let diff = DiffCalculator::new("src", Default::default()).calculate(None, &original);

        let mut target = MemoryModel::new();
        let result = DiffApplicator::new("dst", ApplicatorConfig::default()).apply(&diff, &mut target);
        assert!(result.success);
        assert_eq!(result.applied_changes, 4);
        assert!(extract(&target).same_content(&original));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let source = source_model();
        let diff = DiffCalculator::new("src", Default::default()).calculate(None, &extract(&source));

        let mut target = MemoryModel::new();
        let mut applicator = DiffApplicator::new("dst", ApplicatorConfig::default());
        applicator.apply(&diff, &mut target);
        let once = extract(&target);

        let again = applicator.apply(&diff, &mut target);
        assert!(again.success);
        assert_eq!(again.applied_changes, 0);
        assert_eq!(again.warnings.len(), 4);
        assert!(extract(&target).same_content(&once));
    }

    #[test]
    fn test_modifications_and_removals() {
        let mut model = source_model();
        let before = extract(&model);

        let mut edited = source_model();
        edited.move_to("s1", Point::new(50.0, 50.0)).unwrap();
        edited.remove("s2").unwrap();
        let after = extract(&edited);

        let diff = DiffCalculator::new("src", Default::default()).calculate(Some(&before), &after);
        let result = DiffApplicator::new("dst", ApplicatorConfig::default()).apply(&diff, &mut model);
        assert!(result.success);
        assert!(!model.contains("s2"));
        assert!(!model.contains("c1"));
        assert_eq!(model.element("s1").unwrap().x, Some(50.0));
    }

    #[test]
    fn test_modify_missing_target_is_warning() {
        let mut model = MemoryModel::new();
        let mut diff = DocumentDiff::new("remote", 1, 2);
        diff.modified.push(ModifiedElement {
            id: "ghost".into(),
            changes: vec![Change::Position {
                old: Point::default(),
                new: Point::new(5.0, 5.0),
                delta: Point::new(5.0, 5.0),
            }],
            current: ElementData::shape("ghost", "Task", Point::new(5.0, 5.0), Size::default()),
        });
        let result = DiffApplicator::new("dst", ApplicatorConfig::default()).apply(&diff, &mut model);
        assert!(result.success);
        assert_eq!(result.warnings[0].code, ErrorCode::NotFound);
    }

    #[test]
    fn test_malformed_diff_is_rejected_without_mutation() {
        let mut model = MemoryModel::new();
        let mut diff = diff_adding(vec![task("s1", 0.0), task("s1", 5.0)]);
        diff.removed.push("s1".into());
        let result = DiffApplicator::new("dst", ApplicatorConfig::default()).apply(&diff, &mut model);
        assert!(!result.success);
        assert!(result.errors.iter().all(|e| e.code == ErrorCode::Validation));
        assert!(model.is_empty());
    }

    #[test]
    fn test_failure_rolls_back_whole_call() {
        let mut model = MemoryModel::new();
        model
            .create_shape(ShapeSpec {
                id: "keep".into(),
                element_type: "Task".into(),
                properties: Default::default(),
                custom_properties: Default::default(),
                position: Point::new(0.0, 0.0),
                size: Size::new(10.0, 10.0),
                parent: None,
            })
            .unwrap();
        model.reject_mutations_for("s3");
        let before = extract(&model);

        let mut diff = diff_adding(vec![task("s1", 0.0), task("s2", 100.0), task("s3", 200.0)]);
        diff.removed.push("keep".into());
        let config = ApplicatorConfig {
            batch_size: 1,
            ..Default::default()
        };
        let result = DiffApplicator::new("dst", config).apply(&diff, &mut model);

        assert!(!result.success);
        assert!(result.rolled_back);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].element_id, Some("s3".into()));
        assert_eq!(result.errors[0].code, ErrorCode::Application);
        assert!(extract(&model).same_content(&before));
    }

    #[test]
    fn test_failure_without_rollback_continues() {
        let mut model = MemoryModel::new();
        model.reject_mutations_for("s2");
        let diff = diff_adding(vec![task("s1", 0.0), task("s2", 100.0), task("s3", 200.0)]);
        let config = ApplicatorConfig {
            rollback_on_error: false,
            ..Default::default()
        };
        let result = DiffApplicator::new("dst", config).apply(&diff, &mut model);
        assert!(!result.success);
        assert!(!result.rolled_back);
        assert_eq!(result.applied_changes, 2);
        assert!(model.contains("s1") && model.contains("s3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_connection_retried_once() {
        let mut model = MemoryModel::new();
        let mut applicator = DiffApplicator::new("dst", ApplicatorConfig::default());
        let diff = diff_adding(vec![ElementData::connection("c1", "SequenceFlow", "s1", "s2", vec![])]);

        let result = applicator.apply(&diff, &mut model);
        assert!(result.success);
        assert_eq!(result.deferred, 1);
        assert_eq!(result.warnings[0].code, ErrorCode::NotFound);
        assert!(applicator.has_pending());

        // Not yet due
        assert_eq!(applicator.retry_pending(&mut model).applied_changes, 0);
        assert!(applicator.has_pending());

        let endpoints = diff_adding(vec![task("s1", 0.0), task("s2", 200.0)]);
        applicator.apply(&endpoints, &mut model);
        tokio::time::advance(Duration::from_millis(500)).await;

        let retried = applicator.retry_pending(&mut model);
        assert_eq!(retried.applied_changes, 1);
        assert!(!applicator.has_pending());
        let path = model.element("c1").unwrap().waypoints.unwrap();
        assert_eq!(path, vec![Point::new(50.0, 40.0), Point::new(250.0, 40.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_connection_dropped_after_second_failure() {
        let mut model = MemoryModel::new();
        let mut applicator = DiffApplicator::new("dst", ApplicatorConfig::default());
        let diff = diff_adding(vec![ElementData::connection("c1", "SequenceFlow", "s1", "s2", vec![])]);
        applicator.apply(&diff, &mut model);

        tokio::time::advance(Duration::from_millis(600)).await;
        let retried = applicator.retry_pending(&mut model);
        assert_eq!(retried.applied_changes, 0);
        assert_eq!(retried.warnings.len(), 1);
        assert_eq!(retried.warnings[0].operation, Operation::Retry);
        assert!(!applicator.has_pending());
        assert!(applicator.next_retry_due().is_none());
    }
}
