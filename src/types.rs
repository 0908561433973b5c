//! Core scene types shared across all modules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn one() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }

    /// `position/rotation/scale.set(x, y, z)` on an object handle.
    pub fn set(&mut self, x: f32, y: f32, z: f32) {
        self.x = x;
        self.y = y;
        self.z = z;
    }

    /// Mutable access to a single axis by name (`"x"`, `"y"`, `"z"`).
    pub fn axis_mut(&mut self, axis: &str) -> Option<&mut f32> {
        match axis {
            "x" => Some(&mut self.x),
            "y" => Some(&mut self.y),
            "z" => Some(&mut self.z),
            _ => None,
        }
    }

    /// Accepts `[x, y, z]` or `{ "x": .., "y": .., "z": .. }`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) if items.len() == 3 => Some(Self::new(
                items[0].as_f64()? as f32,
                items[1].as_f64()? as f32,
                items[2].as_f64()? as f32,
            )),
            Value::Object(map) => Some(Self::new(
                map.get("x")?.as_f64()? as f32,
                map.get("y")?.as_f64()? as f32,
                map.get("z")?.as_f64()? as f32,
            )),
            _ => None,
        }
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Transform {
    #[serde(default)]
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default = "Vec3::one")]
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zero(),
            rotation: Vec3::zero(),
            scale: Vec3::one(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scene object tree
// ---------------------------------------------------------------------------

/// A typed attachment on a scene object (`mesh`, `light`, `script`, …).
///
/// Everything except `id` and `type` is kept as free-form data so unknown
/// component kinds survive a load/save cycle untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ComponentRecord {
    pub const SCRIPT: &'static str = "script";
    pub const MATERIAL: &'static str = "material";

    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn is_script(&self) -> bool {
        self.kind == Self::SCRIPT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneObjectNode {
    /// Unique across the whole tree, not just among siblings.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub components: Vec<ComponentRecord>,
    #[serde(default)]
    pub children: Vec<SceneObjectNode>,
}

fn default_visible() -> bool {
    true
}

impl SceneObjectNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transform: Transform::default(),
            visible: true,
            components: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_component(mut self, component: ComponentRecord) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_child(mut self, child: SceneObjectNode) -> Self {
        self.children.push(child);
        self
    }

    /// Script components normalized into [`ScriptComponent`]s.
    /// Records without a `scriptId` are skipped.
    pub fn script_components(&self) -> Vec<ScriptComponent> {
        self.components
            .iter()
            .filter(|c| c.is_script())
            .filter_map(ScriptComponent::from_record)
            .collect()
    }

    /// Depth-first visit of this node and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a SceneObjectNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

// ---------------------------------------------------------------------------
// Script attachment
// ---------------------------------------------------------------------------

/// Normalized view of a `script` component record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptComponent {
    /// Component id – the key of the per-entity script state.
    pub id: String,
    pub script_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_time_scale")]
    pub time_scale: f32,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_time_scale() -> f32 {
    1.0
}

impl ScriptComponent {
    pub fn new(id: impl Into<String>, script_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script_id: script_id.into(),
            enabled: true,
            auto_start: true,
            time_scale: 1.0,
            parameters: Map::new(),
        }
    }

    pub fn from_record(record: &ComponentRecord) -> Option<Self> {
        let mut data = record.data.clone();
        data.insert("id".into(), Value::String(record.id.clone()));
        match serde_json::from_value(Value::Object(data)) {
            Ok(component) => Some(component),
            Err(e) => {
                log::warn!("Ignoring malformed script component {}: {}", record.id, e);
                None
            }
        }
    }

    pub fn to_record(&self) -> ComponentRecord {
        let mut record = ComponentRecord::new(self.id.clone(), ComponentRecord::SCRIPT);
        if let Ok(Value::Object(mut data)) = serde_json::to_value(self) {
            data.remove("id");
            record.data = data;
        }
        record
    }
}

// ---------------------------------------------------------------------------
// Stats & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerStats {
    /// Editor or local updates relayed to the running scene / clients.
    pub relayed: u64,
    /// Override files successfully written.
    pub persisted: u64,
    /// Messages ignored or cycles abandoned.
    pub dropped: u64,
    /// Frames handed to editor clients.
    pub broadcast: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptStats {
    pub entities: usize,
    pub instances: usize,
    pub initialized: usize,
    pub frames_run: u64,
    pub frames_skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Quiet period before a non-temporary edit is written back.
    pub debounce_ms: u64,
    /// Suffix replacing a scene module's extension to form its override file.
    pub override_suffix: String,
    /// Write override files indented (keys are always sorted).
    pub pretty_json: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            override_suffix: ".editor.json".into(),
            pretty_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Rhai operation budget per hook call; exceeding it is a hook error.
    pub max_operations: u64,
    pub max_call_depth: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_depth: 64,
        }
    }
}
