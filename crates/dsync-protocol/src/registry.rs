//! Per-field registry entries
//!
//! `element:<id>` holds an element as its last writer saw it. Each field a
//! modification changes is also written under `field:<id>#<name>`, so two
//! replicas editing different fields of one element both keep their write.
//! Reading an element overlays its field entries on the base copy.

use crate::keys::FIELD_PREFIX;
use dsync_core::{Change, ElementData, ElementId, ElementKind, Point, PropertyMap, Size};
use serde::{Deserialize, Serialize};

/// The latest value of one element field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Position(Point),
    Size(Size),
    Waypoints(Vec<Point>),
    Endpoints { source: ElementId, target: ElementId },
    Parent(Option<ElementId>),
    Property { key: String, value: Option<serde_json::Value> },
    CustomProperty { key: String, value: Option<serde_json::Value> },
}

impl FieldValue {
    /// Field values written by `change`
    pub fn from_change(change: &Change) -> Vec<FieldValue> {
        match change {
            Change::Position { new, .. } => vec![FieldValue::Position(*new)],
            Change::Size { new, .. } => vec![FieldValue::Size(*new)],
            Change::Waypoints { new, .. } => vec![FieldValue::Waypoints(new.clone())],
            Change::ConnectionEndpoints {
                new_source, new_target, ..
            } => vec![FieldValue::Endpoints {
                source: new_source.clone(),
                target: new_target.clone(),
            }],
            Change::Parent { new, .. } => vec![FieldValue::Parent(new.clone())],
            Change::BusinessObject { new, changed_keys, .. } => changed_keys
                .iter()
                .map(|key| FieldValue::Property {
                    key: key.clone(),
                    value: new.get(key).cloned(),
                })
                .collect(),
            Change::CustomProperties { new, changed_keys, .. } => changed_keys
                .iter()
                .map(|key| FieldValue::CustomProperty {
                    key: key.clone(),
                    value: new.get(key).cloned(),
                })
                .collect(),
        }
    }

    /// Key suffix naming this field
    pub fn name(&self) -> String {
        match self {
            FieldValue::Position(_) => "position".into(),
            FieldValue::Size(_) => "size".into(),
            FieldValue::Waypoints(_) => "waypoints".into(),
            FieldValue::Endpoints { .. } => "endpoints".into(),
            FieldValue::Parent(_) => "parent".into(),
            FieldValue::Property { key, .. } => format!("property/{}", key),
            FieldValue::CustomProperty { key, .. } => format!("custom/{}", key),
        }
    }

    /// Overwrite the field in `el`; geometry that does not fit the element kind is ignored
    pub fn apply_to(&self, el: &mut ElementData) {
        match (self, &mut el.kind) {
            (FieldValue::Position(p), ElementKind::Shape { position, .. }) => *position = Some(*p),
            (FieldValue::Size(s), ElementKind::Shape { size, .. }) => *size = Some(*s),
            (FieldValue::Waypoints(points), ElementKind::Connection { waypoints, .. }) => {
                *waypoints = Some(points.clone())
            }
            (
                FieldValue::Endpoints { source, target },
                ElementKind::Connection {
                    source: from, target: to, ..
                },
            ) => {
                *from = source.clone();
                *to = target.clone();
            }
            (FieldValue::Parent(parent), _) => el.parent = parent.clone(),
            (FieldValue::Property { key, value }, _) => set_property(&mut el.business_object, key, value),
            (FieldValue::CustomProperty { key, value }, _) => set_property(&mut el.custom_properties, key, value),
            _ => {}
        }
    }
}

fn set_property(map: &mut PropertyMap, key: &str, value: &Option<serde_json::Value>) {
    match value {
        Some(v) => {
            map.insert(key.to_string(), v.clone());
        }
        None => {
            map.remove(key);
        }
    }
}

/// A field entry as stored in the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub id: ElementId,
    pub field: FieldValue,
}

impl FieldEntry {
    pub fn key(&self) -> String {
        field_key(&self.id, &self.field.name())
    }
}

/// Key prefix shared by every field entry of `id`.
///
/// Ids containing `#` can share a prefix with other ids, so readers compare
/// [`FieldEntry::id`] as well.
pub fn field_prefix(id: &ElementId) -> String {
    format!("{}{}#", FIELD_PREFIX, id)
}

pub fn field_key(id: &ElementId, name: &str) -> String {
    format!("{}{}", field_prefix(id), name)
}

/// Field entries written for the modifications of one element
pub fn field_entries(id: &ElementId, changes: &[Change]) -> Vec<FieldEntry> {
    changes
        .iter()
        .flat_map(FieldValue::from_change)
        .map(|field| FieldEntry { id: id.clone(), field })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_per_changed_key() {
        let mut new = PropertyMap::new();
        new.insert("name".into(), "Renamed".into());
        let changes = vec![
            Change::Position {
                old: Point::new(0.0, 0.0),
                new: Point::new(300.0, 300.0),
                delta: Point::new(300.0, 300.0),
            },
            Change::BusinessObject {
                old: PropertyMap::new(),
                new,
                changed_keys: vec!["name".into(), "owner".into()],
            },
        ];
        let keys: Vec<String> = field_entries(&"s1".into(), &changes).iter().map(FieldEntry::key).collect();
        assert_eq!(
            keys,
            vec!["field:s1#position", "field:s1#property/name", "field:s1#property/owner"]
        );
    }

    #[test]
    fn test_overlay_sets_and_removes_fields() {
        let mut el = ElementData::shape("s1", "Task", Point::new(0.0, 0.0), Size::new(10.0, 10.0));
        el.business_object.insert("owner".into(), "bob".into());

        FieldValue::Position(Point::new(300.0, 300.0)).apply_to(&mut el);
        FieldValue::Property {
            key: "name".into(),
            value: Some("Renamed".into()),
        }
        .apply_to(&mut el);
        FieldValue::Property {
            key: "owner".into(),
            value: None,
        }
        .apply_to(&mut el);
        // Connection geometry does not apply to a shape
        FieldValue::Waypoints(vec![Point::new(1.0, 1.0)]).apply_to(&mut el);

        assert_eq!(el.position(), Some(Point::new(300.0, 300.0)));
        assert_eq!(el.business_object.get("name"), Some(&"Renamed".into()));
        assert!(!el.business_object.contains_key("owner"));
        assert!(el.waypoints().is_none());
    }

    #[test]
    fn test_entry_json_round_trip() {
        let entry = FieldEntry {
            id: "c1".into(),
            field: FieldValue::Endpoints {
                source: "a".into(),
                target: "b".into(),
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"name\":\"endpoints\""));
        assert_eq!(serde_json::from_str::<FieldEntry>(&json).unwrap(), entry);
    }
}
