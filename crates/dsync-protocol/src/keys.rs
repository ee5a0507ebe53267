//! Shared-map key layout
//!
//! ```text
//! diff:<diff-id>        encoded DiffEnvelope
//! element:<element-id>  ElementData as JSON, as its last writer saw it
//! field:<element-id>#<field>  latest value of one modified field
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use dsync_core::ElementId;

pub const DIFF_PREFIX: &str = "diff:";
pub const ELEMENT_PREFIX: &str = "element:";
pub const FIELD_PREFIX: &str = "field:";

/// A parsed shared-map key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Diff(String),
    Element(ElementId),
}

impl MapKey {
    pub fn parse(key: &str) -> ProtocolResult<Self> {
        if let Some(id) = key.strip_prefix(DIFF_PREFIX) {
            if !id.is_empty() {
                return Ok(MapKey::Diff(id.to_string()));
            }
        } else if let Some(id) = key.strip_prefix(ELEMENT_PREFIX) {
            if !id.is_empty() {
                return Ok(MapKey::Element(ElementId::from(id)));
            }
        }
        Err(ProtocolError::InvalidKey(key.to_string()))
    }

    pub fn is_diff(key: &str) -> bool {
        key.starts_with(DIFF_PREFIX)
    }

    pub fn is_element(key: &str) -> bool {
        key.starts_with(ELEMENT_PREFIX)
    }

    pub fn is_field(key: &str) -> bool {
        key.starts_with(FIELD_PREFIX)
    }
}

impl std::fmt::Display for MapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapKey::Diff(id) => write!(f, "{}{}", DIFF_PREFIX, id),
            MapKey::Element(id) => write!(f, "{}{}", ELEMENT_PREFIX, id),
        }
    }
}

pub fn diff_key(diff_id: &str) -> String {
    format!("{}{}", DIFF_PREFIX, diff_id)
}

pub fn element_key(id: &ElementId) -> String {
    format!("{}{}", ELEMENT_PREFIX, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!(MapKey::parse("diff:abc").unwrap(), MapKey::Diff("abc".into()));
        assert_eq!(
            MapKey::parse(&element_key(&"s1".into())).unwrap(),
            MapKey::Element("s1".into())
        );
        assert!(MapKey::parse("diff:").is_err());
        assert!(MapKey::parse("presence:a").is_err());
        assert!(MapKey::parse("field:s1#position").is_err());
    }

    #[test]
    fn test_display_matches_helpers() {
        assert_eq!(MapKey::Diff("d1".into()).to_string(), diff_key("d1"));
        assert!(MapKey::is_element("element:x"));
        assert!(!MapKey::is_diff("element:x"));
        assert!(MapKey::is_field("field:x#size"));
        assert!(!MapKey::is_element("field:x#size"));
    }
}
