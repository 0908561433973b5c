//! Scene model: object tree, editable-property table, live-update
//! application and the script sync points around a frame.
//!
//! ## Layering
//!
//! ```text
//! SceneBehavior::build()          code-defined defaults (tree + properties)
//!   └── overrides document        editor edits, layered on top
//!         { "cubeColor": "#f00",
//!           "scene": { "objects": { "<id>": { "position": [..] } } } }
//! ```
//!
//! Internal init always rebuilds from the behavior and then re-applies the
//! override document, so a scene can be re-activated without losing edits.

use crate::diff::{self, SCENE_KEY};
use crate::error::SceneError;
use crate::lifecycle::ScriptManager;
use crate::protocol::{LiveUpdate, UpdateAction};
use crate::types::{ComponentRecord, SceneObjectNode, Vec3};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type RouteParams = BTreeMap<String, String>;

const OBJECTS_PREFIX: &str = "scene.objects.";

// ---------------------------------------------------------------------------
// Editable property metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Number,
    Boolean,
    String,
    Color,
    Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    pub kind: PropertyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub default: Value,
    pub label: String,
}

/// Declarative table of a scene's editable properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyTable {
    specs: Vec<PropertySpec>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(mut self, name: &str, min: f64, max: f64, default: f64, label: &str) -> Self {
        self.specs.push(PropertySpec {
            name: name.into(),
            kind: PropertyKind::Number,
            min: Some(min),
            max: Some(max),
            default: Value::from(default),
            label: label.into(),
        });
        self
    }

    pub fn boolean(self, name: &str, default: bool, label: &str) -> Self {
        self.plain(name, PropertyKind::Boolean, Value::Bool(default), label)
    }

    pub fn string(self, name: &str, default: &str, label: &str) -> Self {
        self.plain(name, PropertyKind::String, Value::from(default), label)
    }

    pub fn color(self, name: &str, default: &str, label: &str) -> Self {
        self.plain(name, PropertyKind::Color, Value::from(default), label)
    }

    pub fn vector3(self, name: &str, default: Vec3, label: &str) -> Self {
        self.plain(
            name,
            PropertyKind::Vector3,
            serde_json::json!({"x": default.x, "y": default.y, "z": default.z}),
            label,
        )
    }

    fn plain(mut self, name: &str, kind: PropertyKind, default: Value, label: &str) -> Self {
        self.specs.push(PropertySpec {
            name: name.into(),
            kind,
            min: None,
            max: None,
            default,
            label: label.into(),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn specs(&self) -> &[PropertySpec] {
        &self.specs
    }

    pub fn defaults(&self) -> Map<String, Value> {
        self.specs
            .iter()
            .map(|s| (s.name.clone(), s.default.clone()))
            .collect()
    }

    /// Type-check a value against its spec; numbers are clamped into range.
    pub fn validate(&self, name: &str, value: &Value) -> Result<Value, SceneError> {
        let spec = self
            .get(name)
            .ok_or_else(|| SceneError::UnknownProperty(name.to_string()))?;
        let invalid = |message: &str| SceneError::InvalidValue {
            property: name.to_string(),
            message: message.to_string(),
        };
        match spec.kind {
            PropertyKind::Number => {
                let mut n = value.as_f64().ok_or_else(|| invalid("expected a number"))?;
                if let Some(min) = spec.min {
                    n = n.max(min);
                }
                if let Some(max) = spec.max {
                    n = n.min(max);
                }
                Ok(Value::from(n))
            }
            PropertyKind::Boolean => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| invalid("expected a boolean")),
            PropertyKind::String => value
                .as_str()
                .map(Value::from)
                .ok_or_else(|| invalid("expected a string")),
            PropertyKind::Color => match value.as_str() {
                Some(s) if is_hex_color(s) => Ok(Value::from(s)),
                _ => Err(invalid("expected a #rrggbb color")),
            },
            PropertyKind::Vector3 => Vec3::from_json(value)
                .map(|v| serde_json::json!({"x": v.x, "y": v.y, "z": v.z}))
                .ok_or_else(|| invalid("expected [x, y, z] or {x, y, z}")),
        }
    }
}

fn is_hex_color(s: &str) -> bool {
    let Some(hex) = s.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Object tree
// ---------------------------------------------------------------------------

/// Ordered forest of scene objects with tree-wide unique ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneTree {
    pub roots: Vec<SceneObjectNode>,
}

impl SceneTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &str) -> Option<&SceneObjectNode> {
        fn search<'a>(nodes: &'a [SceneObjectNode], id: &str) -> Option<&'a SceneObjectNode> {
            nodes
                .iter()
                .find_map(|n| if n.id == id { Some(n) } else { search(&n.children, id) })
        }
        search(&self.roots, id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut SceneObjectNode> {
        fn search<'a>(
            nodes: &'a mut [SceneObjectNode],
            id: &str,
        ) -> Option<&'a mut SceneObjectNode> {
            for node in nodes {
                if node.id == id {
                    return Some(node);
                }
                if let Some(found) = search(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&mut self.roots, id)
    }

    /// First object (depth-first) with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&SceneObjectNode> {
        let mut found = None;
        self.walk(&mut |n| {
            if found.is_none() && n.name == name {
                found = Some(n);
            }
        });
        found
    }

    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a SceneObjectNode)) {
        for root in &self.roots {
            root.walk(visit);
        }
    }

    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut SceneObjectNode)) {
        fn go(nodes: &mut [SceneObjectNode], visit: &mut dyn FnMut(&mut SceneObjectNode)) {
            for node in nodes {
                visit(node);
                go(&mut node.children, visit);
            }
        }
        go(&mut self.roots, visit);
    }

    pub fn ids(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        self.walk(&mut |n| {
            ids.insert(n.id.clone());
        });
        ids
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Insert a subtree under `parent` (or as a root). Every id in the
    /// subtree must be new to the tree and unique within the subtree.
    pub fn insert(&mut self, parent: Option<&str>, node: SceneObjectNode) -> Result<(), SceneError> {
        let mut existing = self.ids();
        let mut clash = None;
        node.walk(&mut |n| {
            if clash.is_none() && !existing.insert(n.id.clone()) {
                clash = Some(n.id.clone());
            }
        });
        if let Some(id) = clash {
            return Err(SceneError::DuplicateId(id));
        }
        match parent {
            None => self.roots.push(node),
            Some(pid) => self
                .find_mut(pid)
                .ok_or_else(|| SceneError::ObjectNotFound(pid.to_string()))?
                .children
                .push(node),
        }
        Ok(())
    }

    /// Remove an object and its descendants.
    pub fn remove(&mut self, id: &str) -> Option<SceneObjectNode> {
        fn take(nodes: &mut Vec<SceneObjectNode>, id: &str) -> Option<SceneObjectNode> {
            if let Some(pos) = nodes.iter().position(|n| n.id == id) {
                return Some(nodes.remove(pos));
            }
            nodes.iter_mut().find_map(|n| take(&mut n.children, id))
        }
        take(&mut self.roots, id)
    }

    /// Deep-copy an object under the same parent, assigning fresh ids to the
    /// copy, its descendants and their components. Returns the copy's id.
    pub fn duplicate(&mut self, id: &str) -> Result<String, SceneError> {
        let original = self
            .find(id)
            .cloned()
            .ok_or_else(|| SceneError::ObjectNotFound(id.to_string()))?;
        let mut taken = self.ids();
        let mut copy = original;
        reassign_ids(&mut copy, &mut taken);
        let new_id = copy.id.clone();
        let parent = self.parent_of(id);
        self.insert(parent.as_deref(), copy)?;
        Ok(new_id)
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        let mut parent = None;
        self.walk(&mut |n| {
            if parent.is_none() && n.children.iter().any(|c| c.id == id) {
                parent = Some(n.id.clone());
            }
        });
        parent
    }
}

fn reassign_ids(node: &mut SceneObjectNode, taken: &mut HashSet<String>) {
    let base = format!("{}_copy", node.id);
    let mut candidate = base.clone();
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("{}{}", base, n);
        n += 1;
    }
    taken.insert(candidate.clone());
    node.id = candidate;
    for component in &mut node.components {
        component.id = format!("{}_copy", component.id);
    }
    for child in &mut node.children {
        reassign_ids(child, taken);
    }
}

/// Apply one object property (`position`, `rotation.y`, `visible`,
/// `material.color`, …) to a node.
pub fn apply_object_property(
    node: &mut SceneObjectNode,
    property: &str,
    value: &Value,
) -> Result<(), SceneError> {
    let label = format!("{}.{}", node.id, property);
    let invalid = |message: &str| SceneError::InvalidValue {
        property: label.clone(),
        message: message.to_string(),
    };
    let mut parts = property.splitn(2, '.');
    let head = parts.next().unwrap_or_default();
    let rest = parts.next();

    match (head, rest) {
        ("position" | "rotation" | "scale", axis) => {
            let target = match head {
                "position" => &mut node.transform.position,
                "rotation" => &mut node.transform.rotation,
                _ => &mut node.transform.scale,
            };
            match axis {
                None => {
                    let v = Vec3::from_json(value).ok_or_else(|| invalid("expected [x, y, z]"))?;
                    target.set(v.x, v.y, v.z);
                }
                Some(axis) => {
                    let n = value.as_f64().ok_or_else(|| invalid("expected a number"))?;
                    *target
                        .axis_mut(axis)
                        .ok_or_else(|| SceneError::UnknownProperty(property.to_string()))? =
                        n as f32;
                }
            }
        }
        ("visible", None) => {
            node.visible = value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
        }
        ("name", None) => {
            node.name = value
                .as_str()
                .ok_or_else(|| invalid("expected a string"))?
                .to_string();
        }
        ("material", Some(field)) => {
            let material_id = format!("{}-material", node.id);
            let record = match node
                .components
                .iter()
                .position(|c| c.kind == ComponentRecord::MATERIAL)
            {
                Some(pos) => &mut node.components[pos],
                None => {
                    node.components
                        .push(ComponentRecord::new(material_id, ComponentRecord::MATERIAL));
                    let last = node.components.len() - 1;
                    &mut node.components[last]
                }
            };
            record.data.insert(field.to_string(), value.clone());
        }
        _ => return Err(SceneError::UnknownProperty(property.to_string())),
    }
    Ok(())
}

/// Layer a partial object (`{"y": 5}`) over the current object value.
fn merge_partial(current: Option<&Value>, value: &Value) -> Option<Value> {
    let (Some(Value::Object(base)), Value::Object(patch)) = (current, value) else {
        return None;
    };
    let mut merged = base.clone();
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    Some(Value::Object(merged))
}

/// Leaf paths of a JSON object; arrays and scalars are leaves.
fn leaves(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                leaves(&path, v, out);
            }
        }
        _ => out.push((prefix.to_string(), value.clone())),
    }
}

// ---------------------------------------------------------------------------
// Scene state & behavior
// ---------------------------------------------------------------------------

/// Everything about a scene that is not user logic.
#[derive(Debug, Clone, Default)]
pub struct SceneState {
    pub route_path: String,
    pub scene_path: String,
    pub params: RouteParams,
    pub tree: SceneTree,
    /// Current editable-property values.
    pub values: Map<String, Value>,
    /// Editor object registry: name → object id.
    pub registry: BTreeMap<String, String>,
    /// Every override applied so far, in override-file layout.
    pub overrides: Value,
}

impl SceneState {
    /// Add an object to the tree and expose it to the editor by name.
    pub fn spawn(&mut self, parent: Option<&str>, node: SceneObjectNode) -> Result<(), SceneError> {
        let (name, id) = (node.name.clone(), node.id.clone());
        self.tree.insert(parent, node)?;
        self.registry.insert(name, id);
        Ok(())
    }

    /// The `getObject(name)` accessor.
    pub fn get_object(&mut self, name: &str) -> Option<&mut SceneObjectNode> {
        let id = match self.registry.get(name) {
            Some(id) => id.clone(),
            None => self.tree.find_by_name(name)?.id.clone(),
        };
        self.tree.find_mut(&id)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// User-defined scene logic. All hooks are optional.
pub trait SceneBehavior: Send {
    fn properties(&self) -> PropertyTable {
        PropertyTable::default()
    }

    /// Internal init: populate the object tree from code.
    fn build(&mut self, _scene: &mut SceneState) {}

    fn on_enter(&mut self, _scene: &mut SceneState) -> Result<(), SceneError> {
        Ok(())
    }

    fn on_exit(&mut self, _scene: &mut SceneState) -> Result<(), SceneError> {
        Ok(())
    }

    fn cleanup(&mut self, _scene: &mut SceneState) {}

    fn on_property_changed(&mut self, _name: &str, _value: &Value, _scene: &mut SceneState) {}

    fn as_any(&self) -> &dyn std::any::Any;
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub struct Scene {
    instance_id: u64,
    state: SceneState,
    properties: PropertyTable,
    behavior: Box<dyn SceneBehavior>,
    scripts: Arc<ScriptManager>,
    pending: Vec<LiveUpdate>,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl Scene {
    pub fn new(
        scene_path: impl Into<String>,
        behavior: Box<dyn SceneBehavior>,
        scripts: Arc<ScriptManager>,
    ) -> Self {
        let properties = behavior.properties();
        Self {
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            state: SceneState {
                scene_path: scene_path.into(),
                values: properties.defaults(),
                overrides: Value::Object(Map::new()),
                ..Default::default()
            },
            properties,
            behavior,
            scripts,
            pending: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn state(&self) -> &SceneState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SceneState {
        &mut self.state
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    pub fn behavior<T: 'static>(&self) -> Option<&T> {
        self.behavior.as_any().downcast_ref::<T>()
    }

    pub fn scripts(&self) -> Arc<ScriptManager> {
        self.scripts.clone()
    }

    pub fn set_route(&mut self, route_path: &str) {
        self.state.route_path = route_path.to_string();
    }

    pub fn set_params(&mut self, params: RouteParams) {
        self.state.params = params;
    }

    pub fn clear_registry(&mut self) {
        self.state.registry.clear();
    }

    /// Rebuild from the behavior, then re-apply every recorded override.
    pub fn init(&mut self) {
        self.state.tree = SceneTree::new();
        self.state.values = self.properties.defaults();
        self.behavior.build(&mut self.state);
        let overrides = self.state.overrides.clone();
        self.apply_document(&overrides);
        self.sync_scripts();
    }

    pub fn enter(&mut self) -> Result<(), SceneError> {
        self.behavior.on_enter(&mut self.state)
    }

    pub fn exit(&mut self) -> Result<(), SceneError> {
        self.behavior.on_exit(&mut self.state)
    }

    /// Behavior cleanup. Script teardown is async and is the caller's job
    /// (see [`Scene::scripts`]) so no lock is held across it.
    pub fn cleanup(&mut self) {
        self.behavior.cleanup(&mut self.state);
    }

    // -----------------------------------------------------------------------
    // Live updates
    // -----------------------------------------------------------------------

    pub fn apply_update(&mut self, update: &LiveUpdate) -> Result<(), SceneError> {
        match update.action() {
            Some(UpdateAction::Property) => {
                let Some(property) = update.property.as_deref() else {
                    return Ok(());
                };
                self.apply_property(property, &update.value)?;
                self.record_override(property, &update.value);
                Ok(())
            }
            Some(UpdateAction::Reload) => {
                debug!("Reloading scene '{}' from override document", self.state.scene_path);
                self.state.overrides = match &update.value {
                    Value::Object(_) => update.value.clone(),
                    _ => Value::Object(Map::new()),
                };
                self.init();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Hold an update until the scene is next activated.
    pub fn queue_update(&mut self, update: LiveUpdate) {
        self.pending.push(update);
    }

    pub fn pending_updates(&self) -> usize {
        self.pending.len()
    }

    /// Apply queued updates; failures are logged and skipped.
    pub fn drain_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for update in pending {
            if let Err(e) = self.apply_update(&update) {
                warn!("Dropping queued update for '{}': {}", self.state.route_path, e);
            }
        }
        count
    }

    /// Remember an applied edit in override-file layout. Flat properties
    /// store their whole validated value, so sub-path edits (`spawn.y`)
    /// re-apply cleanly on the next init.
    fn record_override(&mut self, property: &str, value: &Value) {
        let overrides = &mut self.state.overrides;
        if property.starts_with(OBJECTS_PREFIX) {
            if value.is_null() {
                diff::remove_dotted(overrides, property);
            } else {
                diff::set_dotted(overrides, property, value.clone());
            }
            return;
        }
        let name = property.split('.').next().unwrap_or(property);
        if name == property && value.is_null() {
            diff::remove_dotted(overrides, name);
        } else if let Some(current) = self.state.values.get(name) {
            diff::set_dotted(overrides, name, current.clone());
        }
    }

    fn apply_property(&mut self, property: &str, value: &Value) -> Result<(), SceneError> {
        if let Some(rest) = property.strip_prefix(OBJECTS_PREFIX) {
            let (id, prop) = rest
                .split_once('.')
                .ok_or_else(|| SceneError::UnknownProperty(property.to_string()))?;
            let node = self
                .state
                .tree
                .find_mut(id)
                .ok_or_else(|| SceneError::ObjectNotFound(id.to_string()))?;
            return apply_object_property(node, prop, value);
        }

        let name = property.split('.').next().unwrap_or(property);
        let validated = if name == property && value.is_null() {
            // A removed override falls back to the declared default.
            self.properties
                .get(name)
                .map(|spec| spec.default.clone())
                .ok_or_else(|| SceneError::UnknownProperty(name.to_string()))?
        } else if name == property {
            let merged = merge_partial(self.state.values.get(name), value);
            self.properties.validate(name, merged.as_ref().unwrap_or(value))?
        } else {
            let mut whole = self
                .state
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| SceneError::UnknownProperty(name.to_string()))?;
            diff::set_dotted(&mut whole, &property[name.len() + 1..], value.clone());
            self.properties.validate(name, &whole)?
        };
        self.state.values.insert(name.to_string(), validated.clone());
        self.behavior
            .on_property_changed(name, &validated, &mut self.state);
        Ok(())
    }

    fn apply_document(&mut self, doc: &Value) {
        let Value::Object(map) = doc else {
            return;
        };
        for (key, value) in map {
            if key == SCENE_KEY {
                let mut objects = Vec::new();
                if let Some(obj) = value.get("objects") {
                    leaves("scene.objects", obj, &mut objects);
                }
                for (path, v) in objects {
                    if let Err(e) = self.apply_property(&path, &v) {
                        warn!("Skipping override '{}': {}", path, e);
                    }
                }
            } else if let Err(e) = self.apply_property(key, value) {
                warn!("Skipping override '{}': {}", key, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Script sync points
    // -----------------------------------------------------------------------

    /// Push the tree into the script manager (before a tick).
    pub fn sync_scripts(&mut self) {
        let ids = self.state.tree.ids();
        for stale in self.scripts.entity_ids() {
            if !ids.contains(&stale) {
                self.scripts.remove_entity(&stale);
            }
        }
        let scripts = self.scripts.clone();
        self.state.tree.walk(&mut |node| scripts.sync_entity(node));
    }

    /// Pull script-driven transforms back into the tree (after a tick).
    pub fn write_back_scripts(&mut self) {
        let scripts = self.scripts.clone();
        self.state.tree.walk_mut(&mut |node| scripts.write_back(node));
    }
}
