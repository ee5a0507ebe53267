//! Scripted edits replayed against running replicas
//!
//! ```json
//! {
//!   "settle-ms": 3000,
//!   "steps": [
//!     {"replica": 0, "at-ms": 0, "op": "create-shape", "id": "s1", "type": "task", "x": 0, "y": 0},
//!     {"replica": 1, "at-ms": 800, "op": "set-properties", "id": "s1", "properties": {"name": "Review"}},
//!     {"replica": 1, "at-ms": 900, "op": "disconnect"}
//!   ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use dsync_core::{
    ConnectionSpec, DiagramModel, ElementId, MemoryModel, ModelResult, Point, PropertyMap, PropertyPatch, ShapeSpec,
    Size,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One edit or connectivity change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Action {
    CreateShape {
        id: String,
        #[serde(rename = "type", default = "default_shape_type")]
        element_type: String,
        x: f64,
        y: f64,
        #[serde(default = "default_width")]
        width: f64,
        #[serde(default = "default_height")]
        height: f64,
        #[serde(default)]
        properties: PropertyMap,
        #[serde(default)]
        parent: Option<String>,
    },
    CreateConnection {
        id: String,
        #[serde(rename = "type", default = "default_connection_type")]
        element_type: String,
        source: String,
        target: String,
        #[serde(default)]
        waypoints: Vec<Point>,
        #[serde(default)]
        properties: PropertyMap,
    },
    Move {
        id: String,
        x: f64,
        y: f64,
    },
    Resize {
        id: String,
        width: f64,
        height: f64,
    },
    /// `null` values remove a property
    SetProperties {
        id: String,
        properties: PropertyPatch,
    },
    Reparent {
        id: String,
        parent: Option<String>,
    },
    Remove {
        id: String,
    },
    Disconnect,
    Reconnect,
    Pause,
    Resume,
}

fn default_shape_type() -> String {
    "task".into()
}

fn default_connection_type() -> String {
    "sequence-flow".into()
}

fn default_width() -> f64 {
    100.0
}

fn default_height() -> f64 {
    80.0
}

impl Action {
    /// Whether this action edits the model (as opposed to the replica's link or engine)
    pub fn is_edit(&self) -> bool {
        !matches!(self, Action::Disconnect | Action::Reconnect | Action::Pause | Action::Resume)
    }

    /// Perform an edit on `model`
    pub fn apply(self, model: &mut MemoryModel) -> ModelResult<()> {
        match self {
            Action::CreateShape {
                id,
                element_type,
                x,
                y,
                width,
                height,
                properties,
                parent,
            } => model.create_shape(ShapeSpec {
                id: id.into(),
                element_type,
                properties,
                custom_properties: PropertyMap::new(),
                position: Point::new(x, y),
                size: Size::new(width, height),
                parent: parent.map(ElementId::from),
            }),
            Action::CreateConnection {
                id,
                element_type,
                source,
                target,
                waypoints,
                properties,
            } => model.create_connection(ConnectionSpec {
                id: id.into(),
                element_type,
                properties,
                custom_properties: PropertyMap::new(),
                source: source.into(),
                target: target.into(),
                waypoints,
                parent: None,
            }),
            Action::Move { id, x, y } => model.move_to(&id, Point::new(x, y)),
            Action::Resize { id, width, height } => model.resize(&id, Size::new(width, height)),
            Action::SetProperties { id, properties } => model.update_properties(&id, &properties),
            Action::Reparent { id, parent } => {
                let parent = parent.map(ElementId::from);
                model.set_parent(&id, parent.as_ref())
            }
            Action::Remove { id } => model.remove(&id),
            Action::Disconnect | Action::Reconnect | Action::Pause | Action::Resume => Ok(()),
        }
    }
}

/// An action performed by one replica at an offset from the start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    #[serde(default)]
    pub replica: usize,
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// A timed list of steps plus how long to wait for convergence afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Scenario {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    pub steps: Vec<Step>,
}

fn default_settle_ms() -> u64 {
    3000
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        let mut scenario: Scenario =
            serde_json::from_str(&text).with_context(|| format!("parsing scenario {}", path.display()))?;
        scenario.steps.sort_by_key(|s| s.at_ms);
        Ok(scenario)
    }

    /// Steps must only address replicas that exist
    pub fn validate(&self, replicas: usize) -> Result<()> {
        if let Some(step) = self.steps.iter().find(|s| s.replica >= replicas) {
            bail!(
                "step at {}ms targets replica {} but only {} are running",
                step.at_ms,
                step.replica,
                replicas
            );
        }
        Ok(())
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Two replicas build a small flow, then rename the same task concurrently
    pub fn builtin(replicas: usize) -> Self {
        let other = if replicas > 1 { 1 } else { 0 };
        let shape = |id: &str, x: f64, name: &str| {
            let mut properties = PropertyMap::new();
            properties.insert("name".into(), name.into());
            Action::CreateShape {
                id: id.into(),
                element_type: default_shape_type(),
                x,
                y: 100.0,
                width: default_width(),
                height: default_height(),
                properties,
                parent: None,
            }
        };
        let rename = |id: &str, name: &str| {
            let mut properties = PropertyPatch::new();
            properties.insert("name".into(), Some(name.into()));
            Action::SetProperties {
                id: id.into(),
                properties,
            }
        };
        let step = |replica, at_ms, action| Step { replica, at_ms, action };

        Scenario {
            settle_ms: default_settle_ms(),
            steps: vec![
                step(0, 0, shape("receive", 0.0, "Receive order")),
                step(0, 100, shape("check", 200.0, "Check stock")),
                step(
                    other,
                    1200,
                    Action::CreateConnection {
                        id: "flow1".into(),
                        element_type: default_connection_type(),
                        source: "receive".into(),
                        target: "check".into(),
                        waypoints: Vec::new(),
                        properties: PropertyMap::new(),
                    },
                ),
                step(0, 2500, rename("check", "Check inventory")),
                step(other, 2500, rename("check", "Verify stock")),
                step(other, 2600, Action::Move { id: "receive".into(), x: 20.0, y: 140.0 }),
            ],
        }
    }
}
