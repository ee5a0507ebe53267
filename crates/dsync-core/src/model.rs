//! Diagram model abstraction and an in-memory implementation
//!
//! The sync engine never owns diagram semantics. It reads elements through
//! [`DiagramModel::elements`] and writes exclusively through the mutation
//! primitives, which is what lets any editing surface plug in.

use crate::element::{now_millis, ElementId, Point, PropertyMap, PropertyPatch, Size};
use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Raw view of a live model element, as the extractor reads it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelElement {
    pub id: ElementId,
    pub element_type: String,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub waypoints: Option<Vec<Point>>,
    pub source: Option<ElementId>,
    pub target: Option<ElementId>,
    pub parent: Option<ElementId>,
    /// Set on label pseudo-elements: the element this label belongs to
    pub label_of: Option<ElementId>,
    pub business_object: PropertyMap,
    pub custom_properties: PropertyMap,
    pub last_modified: u64,
    pub modified_by: Option<String>,
}

impl ModelElement {
    pub fn is_label(&self) -> bool {
        self.label_of.is_some() || self.id.as_str().ends_with("_label")
    }

    pub fn is_connection(&self) -> bool {
        self.source.is_some() || self.target.is_some()
    }

    /// Center of the bounding box, if the element has a position
    pub fn center(&self) -> Option<Point> {
        Some(Point::new(
            self.x? + self.width.unwrap_or(0.0) / 2.0,
            self.y? + self.height.unwrap_or(0.0) / 2.0,
        ))
    }
}

/// Arguments for `DiagramModel::create_shape`
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSpec {
    pub id: ElementId,
    pub element_type: String,
    pub properties: PropertyMap,
    pub custom_properties: PropertyMap,
    pub position: Point,
    pub size: Size,
    pub parent: Option<ElementId>,
}

/// Arguments for `DiagramModel::create_connection`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub id: ElementId,
    pub element_type: String,
    pub properties: PropertyMap,
    pub custom_properties: PropertyMap,
    pub source: ElementId,
    pub target: ElementId,
    pub waypoints: Vec<Point>,
    pub parent: Option<ElementId>,
}

/// What a change notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeAction {
    Create,
    Move,
    Resize,
    Reconnect,
    UpdateWaypoints,
    UpdateProperties,
    Reparent,
    Remove,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Move => "move",
            ChangeAction::Resize => "resize",
            ChangeAction::Reconnect => "reconnect",
            ChangeAction::UpdateWaypoints => "update-waypoints",
            ChangeAction::UpdateProperties => "update-properties",
            ChangeAction::Reparent => "reparent",
            ChangeAction::Remove => "remove",
        }
    }
}

/// Raw change notification emitted by a model after each mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent {
    /// Notification type, e.g. `shape.changed` or `connection.removed`
    pub event_type: String,
    pub element_id: ElementId,
    pub action: ChangeAction,
    pub position: Option<Point>,
    pub size: Option<Size>,
    /// Names of the properties touched by a property update
    pub properties: Vec<String>,
    pub waypoints: Option<Vec<Point>>,
}

impl ModelEvent {
    pub fn new(event_type: impl Into<String>, element_id: impl Into<ElementId>, action: ChangeAction) -> Self {
        Self {
            event_type: event_type.into(),
            element_id: element_id.into(),
            action,
            position: None,
            size: None,
            properties: Vec::new(),
            waypoints: None,
        }
    }

    pub fn with_position(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_properties(mut self, properties: impl IntoIterator<Item = String>) -> Self {
        self.properties = properties.into_iter().collect();
        self
    }

    pub fn with_waypoints(mut self, waypoints: Vec<Point>) -> Self {
        self.waypoints = Some(waypoints);
        self
    }
}

/// Callback receiving model change notifications
pub type ChangeListener = Arc<dyn Fn(ModelEvent) + Send + Sync>;

/// A live diagram model the engine can read and mutate
pub trait DiagramModel {
    /// Every element in the registry, labels included
    fn elements(&self) -> Vec<ModelElement>;

    /// Look up one element by id
    fn element(&self, id: &str) -> Option<ModelElement>;

    fn contains(&self, id: &str) -> bool {
        self.element(id).is_some()
    }

    /// Elements whose type is one of `types`
    fn elements_of_type(&self, types: &[&str]) -> Vec<ModelElement> {
        self.elements()
            .into_iter()
            .filter(|el| types.contains(&el.element_type.as_str()))
            .collect()
    }

    fn create_shape(&mut self, spec: ShapeSpec) -> ModelResult<()>;

    fn create_connection(&mut self, spec: ConnectionSpec) -> ModelResult<()>;

    fn move_to(&mut self, id: &str, position: Point) -> ModelResult<()>;

    fn resize(&mut self, id: &str, size: Size) -> ModelResult<()>;

    fn reconnect(&mut self, id: &str, source: &ElementId, target: &ElementId) -> ModelResult<()>;

    fn update_waypoints(&mut self, id: &str, waypoints: &[Point]) -> ModelResult<()>;

    fn update_properties(&mut self, id: &str, patch: &PropertyPatch) -> ModelResult<()>;

    fn update_custom_properties(&mut self, id: &str, patch: &PropertyPatch) -> ModelResult<()>;

    fn set_parent(&mut self, id: &str, parent: Option<&ElementId>) -> ModelResult<()>;

    /// Remove an element; dependents (children, attached connections, labels) go with it
    fn remove(&mut self, id: &str) -> ModelResult<()>;

    /// Install (or clear) the change-notification callback
    fn set_change_listener(&mut self, listener: Option<ChangeListener>);
}

/// In-memory diagram model
#[derive(Default)]
pub struct MemoryModel {
    elements: BTreeMap<ElementId, ModelElement>,
    listener: Option<ChangeListener>,
    author: Option<String>,
    #[cfg(any(test, feature = "test-util"))]
    rejected: HashSet<ElementId>,
}

impl MemoryModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp mutations with this author in `modified_by`
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Attach a label pseudo-element to an existing element
    pub fn add_label(&mut self, owner: &str, text: &str) -> ModelResult<ElementId> {
        let owner_el = self.get(owner)?.clone();
        let id = ElementId::new(format!("{}_label", owner));
        let mut props = PropertyMap::new();
        props.insert("text".into(), text.into());
        let label = ModelElement {
            id: id.clone(),
            element_type: "label".into(),
            x: owner_el.x,
            y: owner_el.y.map(|y| y + owner_el.height.unwrap_or(0.0)),
            width: Some(90.0),
            height: Some(20.0),
            label_of: Some(owner_el.id.clone()),
            parent: owner_el.parent.clone(),
            business_object: props,
            last_modified: now_millis(),
            ..Default::default()
        };
        self.elements.insert(id.clone(), label);
        Ok(id)
    }

    /// Make every later mutation touching `id` fail with `ModelError::Rejected`
    #[cfg(any(test, feature = "test-util"))]
    pub fn reject_mutations_for(&mut self, id: impl Into<ElementId>) {
        self.rejected.insert(id.into());
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_rejections(&mut self) {
        self.rejected.clear();
    }

    #[cfg(any(test, feature = "test-util"))]
    fn check_rejected(&self, id: &str) -> ModelResult<()> {
        if self.rejected.contains(id) {
            return Err(ModelError::Rejected(id.into()));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn check_rejected(&self, _id: &str) -> ModelResult<()> {
        Ok(())
    }

    fn get(&self, id: &str) -> ModelResult<&ModelElement> {
        self.elements.get(id).ok_or_else(|| ModelError::NotFound(id.into()))
    }

    /// Look up `id` for a mutation; the element is stamped only if `reject` lets it through
    fn get_mut(
        &mut self,
        id: &str,
        reject: impl FnOnce(&ModelElement) -> Option<&'static str>,
    ) -> ModelResult<&mut ModelElement> {
        self.check_rejected(id)?;
        let author = self.author.clone();
        let el = self
            .elements
            .get_mut(id)
            .ok_or_else(|| ModelError::NotFound(id.into()))?;
        if let Some(reason) = reject(el) {
            return Err(ModelError::Invalid {
                id: id.into(),
                reason: reason.into(),
            });
        }
        el.last_modified = now_millis();
        if author.is_some() {
            el.modified_by = author;
        }
        Ok(el)
    }

    fn require(&self, id: &ElementId) -> ModelResult<()> {
        if self.elements.contains_key(id) {
            Ok(())
        } else {
            Err(ModelError::NotFound(id.clone()))
        }
    }

    fn emit(&self, event: ModelEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn event_type(el: &ModelElement, suffix: &str) -> String {
        let class = if el.is_connection() { "connection" } else { "shape" };
        format!("{}.{}", class, suffix)
    }

    /// Collect `id` and everything that cannot outlive it
    fn cascade(&self, id: &ElementId) -> Vec<ElementId> {
        let mut doomed = vec![id.clone()];
        let mut seen: HashSet<ElementId> = doomed.iter().cloned().collect();
        let mut i = 0;
        while i < doomed.len() {
            let current = doomed[i].clone();
            for el in self.elements.values() {
                let depends = el.parent.as_ref() == Some(&current)
                    || el.source.as_ref() == Some(&current)
                    || el.target.as_ref() == Some(&current)
                    || el.label_of.as_ref() == Some(&current);
                if depends && seen.insert(el.id.clone()) {
                    doomed.push(el.id.clone());
                }
            }
            i += 1;
        }
        doomed
    }
}

impl DiagramModel for MemoryModel {
    fn elements(&self) -> Vec<ModelElement> {
        self.elements.values().cloned().collect()
    }

    fn element(&self, id: &str) -> Option<ModelElement> {
        self.elements.get(id).cloned()
    }

    fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    fn create_shape(&mut self, spec: ShapeSpec) -> ModelResult<()> {
        self.check_rejected(spec.id.as_str())?;
        if self.elements.contains_key(&spec.id) {
            return Err(ModelError::AlreadyExists(spec.id));
        }
        if let Some(parent) = &spec.parent {
            self.require(parent)?;
        }
        let el = ModelElement {
            id: spec.id.clone(),
            element_type: spec.element_type,
            x: Some(spec.position.x),
            y: Some(spec.position.y),
            width: Some(spec.size.width),
            height: Some(spec.size.height),
            parent: spec.parent,
            business_object: spec.properties,
            custom_properties: spec.custom_properties,
            last_modified: now_millis(),
            modified_by: self.author.clone(),
            ..Default::default()
        };
        let event = ModelEvent::new(Self::event_type(&el, "added"), spec.id.clone(), ChangeAction::Create)
            .with_position(spec.position)
            .with_size(spec.size);
        self.elements.insert(spec.id, el);
        self.emit(event);
        Ok(())
    }

    fn create_connection(&mut self, spec: ConnectionSpec) -> ModelResult<()> {
        self.check_rejected(spec.id.as_str())?;
        if self.elements.contains_key(&spec.id) {
            return Err(ModelError::AlreadyExists(spec.id));
        }
        self.require(&spec.source)?;
        self.require(&spec.target)?;
        if let Some(parent) = &spec.parent {
            self.require(parent)?;
        }
        let waypoints = if spec.waypoints.is_empty() {
            let from = self.get(spec.source.as_str())?.center();
            let to = self.get(spec.target.as_str())?.center();
            from.into_iter().chain(to).collect()
        } else {
            spec.waypoints
        };
        let el = ModelElement {
            id: spec.id.clone(),
            element_type: spec.element_type,
            waypoints: Some(waypoints.clone()),
            source: Some(spec.source),
            target: Some(spec.target),
            parent: spec.parent,
            business_object: spec.properties,
            custom_properties: spec.custom_properties,
            last_modified: now_millis(),
            modified_by: self.author.clone(),
            ..Default::default()
        };
        let event = ModelEvent::new("connection.added", spec.id.clone(), ChangeAction::Create)
            .with_waypoints(waypoints);
        self.elements.insert(spec.id, el);
        self.emit(event);
        Ok(())
    }

    fn move_to(&mut self, id: &str, position: Point) -> ModelResult<()> {
        let el = self.get_mut(id, |el| {
            el.is_connection().then_some("connections are moved through their waypoints")
        })?;
        el.x = Some(position.x);
        el.y = Some(position.y);
        let event = ModelEvent::new("shape.changed", id, ChangeAction::Move).with_position(position);
        self.emit(event);
        Ok(())
    }

    fn resize(&mut self, id: &str, size: Size) -> ModelResult<()> {
        let el = self.get_mut(id, |el| el.is_connection().then_some("connections have no size"))?;
        el.width = Some(size.width);
        el.height = Some(size.height);
        let event = ModelEvent::new("shape.changed", id, ChangeAction::Resize).with_size(size);
        self.emit(event);
        Ok(())
    }

    fn reconnect(&mut self, id: &str, source: &ElementId, target: &ElementId) -> ModelResult<()> {
        self.require(source)?;
        self.require(target)?;
        let el = self.get_mut(id, |el| (!el.is_connection()).then_some("only connections can be reconnected"))?;
        el.source = Some(source.clone());
        el.target = Some(target.clone());
        self.emit(ModelEvent::new("connection.changed", id, ChangeAction::Reconnect));
        Ok(())
    }

    fn update_waypoints(&mut self, id: &str, waypoints: &[Point]) -> ModelResult<()> {
        let el = self.get_mut(id, |el| (!el.is_connection()).then_some("only connections have waypoints"))?;
        el.waypoints = Some(waypoints.to_vec());
        let event = ModelEvent::new("connection.changed", id, ChangeAction::UpdateWaypoints)
            .with_waypoints(waypoints.to_vec());
        self.emit(event);
        Ok(())
    }

    fn update_properties(&mut self, id: &str, patch: &PropertyPatch) -> ModelResult<()> {
        let el = self.get_mut(id, |_| None)?;
        for (key, value) in patch {
            match value {
                Some(v) => {
                    el.business_object.insert(key.clone(), v.clone());
                }
                None => {
                    el.business_object.remove(key);
                }
            }
        }
        let event_type = Self::event_type(el, "changed");
        let event = ModelEvent::new(event_type, id, ChangeAction::UpdateProperties)
            .with_properties(patch.keys().cloned());
        self.emit(event);
        Ok(())
    }

    fn update_custom_properties(&mut self, id: &str, patch: &PropertyPatch) -> ModelResult<()> {
        let el = self.get_mut(id, |_| None)?;
        for (key, value) in patch {
            match value {
                Some(v) => {
                    el.custom_properties.insert(key.clone(), v.clone());
                }
                None => {
                    el.custom_properties.remove(key);
                }
            }
        }
        let event_type = Self::event_type(el, "changed");
        let event = ModelEvent::new(event_type, id, ChangeAction::UpdateProperties)
            .with_properties(patch.keys().map(|k| format!("custom:{}", k)));
        self.emit(event);
        Ok(())
    }

    fn set_parent(&mut self, id: &str, parent: Option<&ElementId>) -> ModelResult<()> {
        if let Some(p) = parent {
            self.require(p)?;
            if self.cascade(&ElementId::from(id)).contains(p) {
                return Err(ModelError::Invalid {
                    id: id.into(),
                    reason: format!("{} is a descendant", p),
                });
            }
        }
        let el = self.get_mut(id, |_| None)?;
        el.parent = parent.cloned();
        let event_type = Self::event_type(el, "changed");
        self.emit(ModelEvent::new(event_type, id, ChangeAction::Reparent));
        Ok(())
    }

    fn remove(&mut self, id: &str) -> ModelResult<()> {
        self.check_rejected(id)?;
        let root = self.get(id)?.id.clone();
        for doomed in self.cascade(&root) {
            if let Some(el) = self.elements.remove(&doomed) {
                if el.is_label() {
                    continue;
                }
                let event_type = Self::event_type(&el, "removed");
                self.emit(ModelEvent::new(event_type, doomed, ChangeAction::Remove));
            }
        }
        Ok(())
    }

    fn set_change_listener(&mut self, listener: Option<ChangeListener>) {
        self.listener = listener;
    }
}

impl std::fmt::Debug for MemoryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryModel")
            .field("elements", &self.elements.len())
            .field("author", &self.author)
            .finish()
    }
}
