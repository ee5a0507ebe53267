//! Live model -> `DocumentState` snapshots

use crate::element::{now_millis, ElementData, ElementKind, Point, PropertyMap, Size};
use crate::error::{Error, Result};
use crate::model::{DiagramModel, ModelElement};
use crate::state::{DocumentState, StateMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// What the extractor records for each element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExtractorConfig {
    /// Record position/size for shapes and waypoints for connections
    pub include_visual_info: bool,
    pub include_business_objects: bool,
    pub include_custom_properties: bool,
    /// When non-empty, only these element types are extracted
    pub include_types: Vec<String>,
    pub exclude_types: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            include_visual_info: true,
            include_business_objects: true,
            include_custom_properties: true,
            include_types: Vec::new(),
            exclude_types: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    fn accepts_type(&self, element_type: &str) -> bool {
        if !self.include_types.is_empty() && !self.include_types.iter().any(|t| t == element_type) {
            return false;
        }
        !self.exclude_types.iter().any(|t| t == element_type)
    }
}

/// Builds canonical snapshots from a live model
#[derive(Debug)]
pub struct StateExtractor {
    client_id: String,
    config: ExtractorConfig,
    version: u64,
}

impl StateExtractor {
    pub fn new(client_id: impl Into<String>, config: ExtractorConfig) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            version: 0,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Version of the last snapshot produced
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot every element of `model`; malformed elements are skipped, never fatal
    pub fn extract<M: DiagramModel + ?Sized>(&mut self, model: &M) -> DocumentState {
        let started = Instant::now();
        let mut elements = HashMap::new();
        let mut metadata = StateMetadata::default();

        for raw in model.elements() {
            if raw.is_label() || !self.config.accepts_type(&raw.element_type) {
                continue;
            }
            match self.extract_element(&raw) {
                Ok(data) => {
                    if data.is_connection() {
                        metadata.connection_count += 1;
                    } else {
                        metadata.shape_count += 1;
                    }
                    if elements.insert(data.id.clone(), data).is_some() {
                        warn!(element_id = %raw.id, "Model returned the same element twice");
                    }
                }
                Err(e) => {
                    warn!(element_id = %raw.id, error = %e, "Skipping element during extraction");
                    metadata.skipped += 1;
                }
            }
        }

        self.version += 1;
        metadata.element_count = elements.len();
        metadata.extraction_ms = started.elapsed().as_millis() as u64;
        debug!(
            client_id = %self.client_id,
            version = self.version,
            elements = metadata.element_count,
            skipped = metadata.skipped,
            "Extracted document state"
        );

        DocumentState {
            timestamp: now_millis(),
            version: self.version,
            client_id: self.client_id.clone(),
            elements,
            metadata,
        }
    }

    /// Snapshot one element by id, if present and extractable
    pub fn extract_one<M: DiagramModel + ?Sized>(&self, model: &M, id: &str) -> Option<ElementData> {
        let raw = model.element(id)?;
        if raw.is_label() || !self.config.accepts_type(&raw.element_type) {
            return None;
        }
        self.extract_element(&raw).ok()
    }

    /// Convert one raw element into its canonical form
    pub fn extract_element(&self, raw: &ModelElement) -> Result<ElementData> {
        let fail = |message: &str| Error::Extraction {
            element_id: raw.id.clone(),
            message: message.to_string(),
        };

        if raw.id.is_empty() {
            return Err(fail("element has no id"));
        }
        if raw.element_type.is_empty() {
            return Err(fail("element has no type"));
        }

        let visual = self.config.include_visual_info;
        let kind = match (&raw.source, &raw.target) {
            (Some(source), Some(target)) => {
                let waypoints = if visual {
                    let points = raw.waypoints.clone().unwrap_or_default();
                    if points.iter().any(|p| !p.is_finite()) {
                        return Err(fail("non-finite waypoint"));
                    }
                    Some(points)
                } else {
                    None
                };
                ElementKind::Connection {
                    source: source.clone(),
                    target: target.clone(),
                    waypoints,
                }
            }
            (None, None) => {
                let (position, size) = if visual {
                    let position = match (raw.x, raw.y) {
                        (Some(x), Some(y)) => Some(Point::new(x, y)),
                        (None, None) => None,
                        _ => return Err(fail("shape has a partial position")),
                    };
                    let size = match (raw.width, raw.height) {
                        (Some(w), Some(h)) => Some(Size::new(w, h)),
                        _ => None,
                    };
                    if position.map_or(false, |p| !p.is_finite()) || size.map_or(false, |s| !s.is_finite()) {
                        return Err(fail("non-finite geometry"));
                    }
                    (position, size)
                } else {
                    (None, None)
                };
                ElementKind::Shape { position, size }
            }
            _ => return Err(fail("connection is missing an endpoint")),
        };

        Ok(ElementData {
            id: raw.id.clone(),
            element_type: raw.element_type.clone(),
            kind,
            business_object: if self.config.include_business_objects {
                raw.business_object.clone()
            } else {
                PropertyMap::new()
            },
            custom_properties: if self.config.include_custom_properties {
                raw.custom_properties.clone()
            } else {
                PropertyMap::new()
            },
            parent: raw.parent.clone(),
            last_modified: raw.last_modified,
            modified_by: raw.modified_by.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementId;
    use crate::model::{ConnectionSpec, MemoryModel, ShapeSpec};

    fn populated() -> MemoryModel {
        let mut model = MemoryModel::new();
        for (id, x) in [("s1", 0.0), ("s2", 200.0)] {
            model
                .create_shape(ShapeSpec {
                    id: id.into(),
                    element_type: "Task".into(),
                    properties: PropertyMap::new(),
                    custom_properties: PropertyMap::new(),
                    position: Point::new(x, 0.0),
                    size: Size::new(100.0, 80.0),
                    parent: None,
                })
                .unwrap();
        }
        model
            .create_connection(ConnectionSpec {
                id: "c1".into(),
                element_type: "SequenceFlow".into(),
                properties: PropertyMap::new(),
                custom_properties: PropertyMap::new(),
                source: "s1".into(),
                target: "s2".into(),
                waypoints: vec![Point::new(100.0, 40.0), Point::new(200.0, 40.0)],
                parent: None,
            })
            .unwrap();
        model.add_label("s1", "Review").unwrap();
        model
    }

    #[test]
    fn test_extract_classifies_and_skips_labels() {
        let model = populated();
        let mut extractor = StateExtractor::new("a", ExtractorConfig::default());
        let state = extractor.extract(&model);

        assert_eq!(state.len(), 3);
        assert!(!state.contains("s1_label"));
        assert_eq!(state.metadata.shape_count, 2);
        assert_eq!(state.metadata.connection_count, 1);

        let conn = state.get("c1").unwrap();
        assert!(conn.is_connection());
        assert!(conn.position().is_none());
        assert_eq!(conn.waypoints().unwrap().len(), 2);

        let shape = state.get("s1").unwrap();
        assert_eq!(shape.position(), Some(Point::new(0.0, 0.0)));
        assert!(shape.waypoints().is_none());
    }

    #[test]
    fn test_versions_increase() {
        let model = populated();
        let mut extractor = StateExtractor::new("a", ExtractorConfig::default());
        let first = extractor.extract(&model);
        let second = extractor.extract(&model);
        assert!(second.version > first.version);
        assert!(first.same_content(&second));
    }

    #[test]
    fn test_type_filters_and_visual_toggle() {
        let model = populated();
        let config = ExtractorConfig {
            include_visual_info: false,
            exclude_types: vec!["SequenceFlow".into()],
            ..Default::default()
        };
        let mut extractor = StateExtractor::new("a", config);
        let state = extractor.extract(&model);
        assert_eq!(state.len(), 2);
        assert!(state.get("s1").unwrap().position().is_none());

        let only_flows = ExtractorConfig {
            include_types: vec!["SequenceFlow".into()],
            ..Default::default()
        };
        let state = StateExtractor::new("a", only_flows).extract(&model);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_extract_one_honours_type_filters() {
        let model = populated();
        let no_flows = StateExtractor::new(
            "a",
            ExtractorConfig {
                exclude_types: vec!["SequenceFlow".into()],
                ..Default::default()
            },
        );
        assert!(no_flows.extract_one(&model, "c1").is_none());
        assert!(no_flows.extract_one(&model, "s1").is_some());

        let only_flows = StateExtractor::new(
            "a",
            ExtractorConfig {
                include_types: vec!["SequenceFlow".into()],
                ..Default::default()
            },
        );
        assert!(only_flows.extract_one(&model, "s1").is_none());
        assert_eq!(only_flows.extract_one(&model, "c1").unwrap().id.as_str(), "c1");
    }

    #[test]
    fn test_malformed_element_is_omitted() {
        let extractor = StateExtractor::new("a", ExtractorConfig::default());
        let half_connection = ModelElement {
            id: ElementId::from("c9"),
            element_type: "SequenceFlow".into(),
            source: Some("s1".into()),
            ..Default::default()
        };
        assert!(extractor.extract_element(&half_connection).is_err());

        let nan_shape = ModelElement {
            id: ElementId::from("s9"),
            element_type: "Task".into(),
            x: Some(f64::NAN),
            y: Some(0.0),
            ..Default::default()
        };
        assert!(extractor.extract_element(&nan_shape).is_err());
    }
}
