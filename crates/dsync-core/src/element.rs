//! Element snapshot types

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Semantic or custom property map; ordered so equality and hashing are stable
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Property updates: `Some` sets a key, `None` removes it
pub type PropertyPatch = BTreeMap<String, Option<serde_json::Value>>;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Diagram element identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ElementId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ElementId> for ElementId {
    fn from(id: &ElementId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for ElementId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ElementId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A point in diagram coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Component-wise difference `self - other`
    pub fn delta(&self, other: &Point) -> Point {
        Point::new(self.x - other.x, self.y - other.y)
    }

    /// True when both axes differ by less than `tolerance`
    pub fn within(&self, other: &Point, tolerance: f64) -> bool {
        (self.x - other.x).abs() < tolerance && (self.y - other.y).abs() < tolerance
    }
}

/// Width and height of a shape
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_finite(&self) -> bool {
        self.width.is_finite() && self.height.is_finite()
    }

    pub fn within(&self, other: &Size, tolerance: f64) -> bool {
        (self.width - other.width).abs() < tolerance && (self.height - other.height).abs() < tolerance
    }
}

/// Shape vs. connection, with the geometry each one carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ElementKind {
    Shape {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<Size>,
    },
    Connection {
        source: ElementId,
        target: ElementId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        waypoints: Option<Vec<Point>>,
    },
}

/// Canonical snapshot of one diagram element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementData {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(flatten)]
    pub kind: ElementKind,
    #[serde(default)]
    pub business_object: PropertyMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: PropertyMap,
    #[serde(default)]
    pub parent: Option<ElementId>,
    #[serde(default)]
    pub last_modified: u64,
    #[serde(default)]
    pub modified_by: Option<String>,
}

impl ElementData {
    /// A shape with position and size
    pub fn shape(id: impl Into<ElementId>, element_type: impl Into<String>, position: Point, size: Size) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            kind: ElementKind::Shape {
                position: Some(position),
                size: Some(size),
            },
            business_object: PropertyMap::new(),
            custom_properties: PropertyMap::new(),
            parent: None,
            last_modified: 0,
            modified_by: None,
        }
    }

    /// A connection between two existing elements
    pub fn connection(
        id: impl Into<ElementId>,
        element_type: impl Into<String>,
        source: impl Into<ElementId>,
        target: impl Into<ElementId>,
        waypoints: Vec<Point>,
    ) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            kind: ElementKind::Connection {
                source: source.into(),
                target: target.into(),
                waypoints: Some(waypoints),
            },
            business_object: PropertyMap::new(),
            custom_properties: PropertyMap::new(),
            parent: None,
            last_modified: 0,
            modified_by: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<ElementId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.business_object.insert(key.into(), value.into());
        self
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.kind, ElementKind::Connection { .. })
    }

    pub fn position(&self) -> Option<Point> {
        match &self.kind {
            ElementKind::Shape { position, .. } => *position,
            ElementKind::Connection { .. } => None,
        }
    }

    pub fn size(&self) -> Option<Size> {
        match &self.kind {
            ElementKind::Shape { size, .. } => *size,
            ElementKind::Connection { .. } => None,
        }
    }

    pub fn waypoints(&self) -> Option<&[Point]> {
        match &self.kind {
            ElementKind::Connection { waypoints, .. } => waypoints.as_deref(),
            ElementKind::Shape { .. } => None,
        }
    }

    /// Source and target ids for connections
    pub fn endpoints(&self) -> Option<(&ElementId, &ElementId)> {
        match &self.kind {
            ElementKind::Connection { source, target, .. } => Some((source, target)),
            ElementKind::Shape { .. } => None,
        }
    }

    /// Ids this element needs to exist before it can be created
    pub fn dependencies(&self) -> impl Iterator<Item = &ElementId> {
        let endpoints = match &self.kind {
            ElementKind::Connection { source, target, .. } => [Some(source), Some(target)],
            ElementKind::Shape { .. } => [None, None],
        };
        self.parent.iter().chain(endpoints.into_iter().flatten())
    }

    /// Center of a shape's bounding box
    pub fn center(&self) -> Option<Point> {
        let pos = self.position()?;
        let size = self.size().unwrap_or_default();
        Some(Point::new(pos.x + size.width / 2.0, pos.y + size.height / 2.0))
    }

    /// Check that all numeric geometry is finite and ids are present
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("element id is empty".into());
        }
        if self.element_type.is_empty() {
            return Err(format!("element {} has no type", self.id));
        }
        match &self.kind {
            ElementKind::Shape { position, size } => {
                if position.map_or(false, |p| !p.is_finite()) || size.map_or(false, |s| !s.is_finite()) {
                    return Err(format!("shape {} has non-finite geometry", self.id));
                }
            }
            ElementKind::Connection { source, target, waypoints } => {
                if source.is_empty() || target.is_empty() {
                    return Err(format!("connection {} is missing an endpoint", self.id));
                }
                if waypoints.as_ref().map_or(false, |w| w.iter().any(|p| !p.is_finite())) {
                    return Err(format!("connection {} has non-finite waypoints", self.id));
                }
            }
        }
        if self.parent.as_ref() == Some(&self.id) {
            return Err(format!("element {} is its own parent", self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_accessors() {
        let shape = ElementData::shape("s1", "Task", Point::new(10.0, 20.0), Size::new(100.0, 80.0));
        assert!(!shape.is_connection());
        assert_eq!(shape.center(), Some(Point::new(60.0, 60.0)));
        assert!(shape.waypoints().is_none());
        assert_eq!(shape.dependencies().count(), 0);
    }

    #[test]
    fn test_connection_dependencies() {
        let conn = ElementData::connection("c1", "SequenceFlow", "s1", "s2", vec![]).with_parent("p1");
        let deps: Vec<_> = conn.dependencies().map(|d| d.as_str()).collect();
        assert_eq!(deps, vec!["p1", "s1", "s2"]);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let bad = ElementData::shape("s1", "Task", Point::new(f64::NAN, 0.0), Size::default());
        assert!(bad.validate().is_err());

        let self_parent = ElementData::shape("s1", "Task", Point::default(), Size::default()).with_parent("s1");
        assert!(self_parent.validate().is_err());
    }

    #[test]
    fn test_serde_shape_layout() {
        let shape = ElementData::shape("s1", "Task", Point::new(1.0, 2.0), Size::new(3.0, 4.0))
            .with_property("name", "Review");
        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(json["kind"], "shape");
        assert_eq!(json["type"], "Task");
        assert_eq!(json["position"]["x"], 1.0);
        assert_eq!(json["businessObject"]["name"], "Review");

        let back: ElementData = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }
}
