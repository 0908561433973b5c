//! Script registry, compiler and the Rhai hook executor.
//!
//! ## Hook contract
//!
//! A script is Rhai source exporting any subset of these functions:
//!
//! | Hook          | Accepted names                  |
//! |---------------|---------------------------------|
//! | init          | `init`                          |
//! | update        | `update`                        |
//! | lateUpdate    | `lateUpdate`, `late_update`     |
//! | fixedUpdate   | `fixedUpdate`, `fixed_update`   |
//! | destroy       | `destroy`                       |
//!
//! Each hook takes zero or one parameter (`ctx`). Inside a hook `this` is the
//! entity map:
//!
//! ```text
//! fn update(ctx) {
//!     this.rotation.y += ctx.delta_time * 0.5;
//! }
//! ```
//!
//! `ctx` carries `delta_time` (already scaled by the component's time scale),
//! `total_time`, `component_id` and `params`.

use crate::error::{CompileError, HookError};
use crate::types::{ScriptComponent, ScriptConfig, Vec3};
use futures::future::BoxFuture;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    Init,
    Update,
    LateUpdate,
    FixedUpdate,
    Destroy,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::Init,
        Hook::Update,
        Hook::LateUpdate,
        Hook::FixedUpdate,
        Hook::Destroy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Hook::Init => "init",
            Hook::Update => "update",
            Hook::LateUpdate => "lateUpdate",
            Hook::FixedUpdate => "fixedUpdate",
            Hook::Destroy => "destroy",
        }
    }

    fn from_fn_name(name: &str) -> Option<Self> {
        match name {
            "init" => Some(Hook::Init),
            "update" => Some(Hook::Update),
            "lateUpdate" | "late_update" => Some(Hook::LateUpdate),
            "fixedUpdate" | "fixed_update" => Some(Hook::FixedUpdate),
            "destroy" => Some(Hook::Destroy),
            _ => None,
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Definitions & compiled scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDefinition {
    pub id: String,
    pub name: String,
    pub source_text: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

impl ScriptDefinition {
    pub fn new(id: impl Into<String>, source_text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_text: source_text.into(),
            enabled: true,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// The script function bound to a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFn {
    pub fn_name: String,
    pub arity: usize,
}

/// Result of compiling one revision of a [`ScriptDefinition`].
///
/// Never mutated after construction; a new revision replaces the whole
/// `Arc<CompiledScript>` in the registry.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub id: String,
    pub name: String,
    pub revision: u64,
    pub enabled: bool,
    pub priority: i32,
    pub has_errors: bool,
    pub last_error: Option<String>,
    hooks: BTreeMap<Hook, HookFn>,
    program: Option<AST>,
}

impl CompiledScript {
    fn failed(def: &ScriptDefinition, revision: u64, error: CompileError) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            revision,
            enabled: def.enabled,
            priority: def.priority,
            has_errors: true,
            last_error: Some(error.to_string()),
            hooks: BTreeMap::new(),
            program: None,
        }
    }

    pub fn has_hook(&self, hook: Hook) -> bool {
        self.hooks.contains_key(&hook)
    }

    pub fn hook(&self, hook: Hook) -> Option<&HookFn> {
        self.hooks.get(&hook)
    }

    pub fn hooks(&self) -> impl Iterator<Item = Hook> + '_ {
        self.hooks.keys().copied()
    }

    pub fn program(&self) -> Option<&AST> {
        self.program.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Engine + compiler
// ---------------------------------------------------------------------------

/// Shared Rhai engine used for both compiling and running hooks.
pub struct ScriptEngine {
    engine: Engine,
}

impl ScriptEngine {
    pub fn new(config: &ScriptConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_depth);
        engine.on_print(|text| log::info!(target: "script", "{}", text));
        engine.on_debug(|text, source, pos| {
            log::debug!(target: "script", "{} @ {:?} {}", text, source, pos)
        });
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile a definition. Never fails: errors are recorded on the result,
    /// which then exposes no hooks.
    pub fn compile(&self, def: &ScriptDefinition, revision: u64) -> CompiledScript {
        let ast = match self.engine.compile(&def.source_text) {
            Ok(ast) => ast,
            Err(e) => {
                let err = CompileError::Syntax {
                    script: def.id.clone(),
                    message: e.to_string(),
                };
                warn!("{}", err);
                return CompiledScript::failed(def, revision, err);
            }
        };

        let mut hooks = BTreeMap::new();
        for f in ast.iter_functions() {
            let Some(hook) = Hook::from_fn_name(f.name) else {
                continue;
            };
            if f.params.len() > 1 {
                let err = CompileError::HookSignature {
                    script: def.id.clone(),
                    hook: f.name.to_string(),
                    arity: f.params.len(),
                };
                warn!("{}", err);
                return CompiledScript::failed(def, revision, err);
            }
            hooks.insert(
                hook,
                HookFn {
                    fn_name: f.name.to_string(),
                    arity: f.params.len(),
                },
            );
        }

        debug!(
            "Compiled script '{}' rev {} with hooks {:?}",
            def.id,
            revision,
            hooks.keys().collect::<Vec<_>>()
        );

        CompiledScript {
            id: def.id.clone(),
            name: def.name.clone(),
            revision,
            enabled: def.enabled,
            priority: def.priority,
            has_errors: false,
            last_error: None,
            hooks,
            program: Some(ast),
        }
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(&ScriptConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryEntry {
    definition: ScriptDefinition,
    compiled: Arc<CompiledScript>,
}

/// Owns every [`ScriptDefinition`] and its current [`CompiledScript`].
///
/// Compilation happens outside the lock; the swap is a single write, so
/// readers see either the old or the new revision, never a mix. Callers
/// already holding the old `Arc` finish with it.
pub struct ScriptRegistry {
    engine: Arc<ScriptEngine>,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    next_revision: AtomicU64,
}

impl ScriptRegistry {
    pub fn new(engine: Arc<ScriptEngine>) -> Self {
        Self {
            engine,
            entries: RwLock::new(HashMap::new()),
            next_revision: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> Arc<ScriptEngine> {
        self.engine.clone()
    }

    /// Register (or replace) a definition and compile it.
    pub fn register(&self, definition: ScriptDefinition) -> Arc<CompiledScript> {
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(self.engine.compile(&definition, revision));
        self.entries.write().insert(
            definition.id.clone(),
            RegistryEntry {
                definition,
                compiled: compiled.clone(),
            },
        );
        compiled
    }

    /// Replace the source of an existing script and recompile.
    pub fn update_source(&self, id: &str, source_text: &str) -> Option<Arc<CompiledScript>> {
        let mut definition = self.definition(id)?;
        definition.source_text = source_text.to_string();
        Some(self.register(definition))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Option<Arc<CompiledScript>> {
        let mut definition = self.definition(id)?;
        if definition.enabled == enabled {
            return self.get(id);
        }
        definition.enabled = enabled;
        Some(self.register(definition))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledScript>> {
        self.entries.read().get(id).map(|e| e.compiled.clone())
    }

    pub fn definition(&self, id: &str) -> Option<ScriptDefinition> {
        self.entries.read().get(id).map(|e| e.definition.clone())
    }

    /// `(id, last_error)` for every script whose current revision failed.
    pub fn errors(&self) -> Vec<(String, String)> {
        let mut errors: Vec<_> = self
            .entries
            .read()
            .values()
            .filter_map(|e| {
                e.compiled
                    .last_error
                    .as_ref()
                    .map(|msg| (e.definition.id.clone(), msg.clone()))
            })
            .collect();
        errors.sort();
        errors
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ScriptEngine::default()))
    }
}

// ---------------------------------------------------------------------------
// Hook invocation
// ---------------------------------------------------------------------------

/// The entity-scoped data a hook may read and write.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptEntity {
    pub id: String,
    pub name: String,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub visible: bool,
    /// Free-form per-entity data scripts can stash values in.
    pub data: Map<String, Value>,
}

impl ScriptEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            scale: Vec3::one(),
            visible: true,
            ..Default::default()
        }
    }
}

pub type EntityHandle = Arc<Mutex<ScriptEntity>>;

/// Everything an executor needs for one hook call.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook: Hook,
    /// Frame delta already multiplied by the component's `time_scale`.
    pub delta_time: f32,
    pub total_time: f64,
    pub component: Arc<ScriptComponent>,
    pub entity: EntityHandle,
}

/// Runs a compiled script's hook. The returned future may suspend; the
/// lifecycle manager joins all futures of a phase before the next phase.
pub trait ScriptExecutor: Send + Sync {
    fn invoke(
        &self,
        script: Arc<CompiledScript>,
        ctx: HookContext,
    ) -> BoxFuture<'static, Result<(), HookError>>;
}

/// Executes hooks synchronously on the shared Rhai engine.
pub struct RhaiExecutor {
    engine: Arc<ScriptEngine>,
}

impl RhaiExecutor {
    pub fn new(engine: Arc<ScriptEngine>) -> Self {
        Self { engine }
    }

    fn call(&self, script: &CompiledScript, ctx: &HookContext) -> Result<(), HookError> {
        let hook_name = ctx.hook.name();
        let ast = script.program().ok_or_else(|| HookError::NotCompiled {
            script: script.id.clone(),
        })?;
        let Some(hook_fn) = script.hook(ctx.hook) else {
            return Ok(());
        };

        let mut this = entity_to_dynamic(&ctx.entity.lock());
        let ctx_map = context_to_dynamic(ctx);
        let mut scope = Scope::new();
        let engine = self.engine.engine();

        let result = if hook_fn.arity == 0 {
            let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut this);
            engine.call_fn_with_options::<Dynamic>(options, &mut scope, ast, &hook_fn.fn_name, ())
        } else {
            let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut this);
            engine.call_fn_with_options::<Dynamic>(
                options,
                &mut scope,
                ast,
                &hook_fn.fn_name,
                (ctx_map,),
            )
        };

        result.map_err(|e| HookError::Runtime {
            script: script.id.clone(),
            hook: hook_name,
            message: e.to_string(),
        })?;

        let mut entity = ctx.entity.lock();
        write_back_entity(&this, &mut entity).map_err(|message| HookError::EntityDecode {
            script: script.id.clone(),
            hook: hook_name,
            message,
        })
    }
}

impl ScriptExecutor for RhaiExecutor {
    fn invoke(
        &self,
        script: Arc<CompiledScript>,
        ctx: HookContext,
    ) -> BoxFuture<'static, Result<(), HookError>> {
        let result = self.call(&script, &ctx);
        Box::pin(futures::future::ready(result))
    }
}

fn vec3_to_dynamic(v: Vec3) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("x".into(), (v.x as rhai::FLOAT).into());
    map.insert("y".into(), (v.y as rhai::FLOAT).into());
    map.insert("z".into(), (v.z as rhai::FLOAT).into());
    Dynamic::from_map(map)
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn entity_to_dynamic(entity: &ScriptEntity) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("id".into(), entity.id.clone().into());
    map.insert("name".into(), entity.name.clone().into());
    map.insert("position".into(), vec3_to_dynamic(entity.position));
    map.insert("rotation".into(), vec3_to_dynamic(entity.rotation));
    map.insert("scale".into(), vec3_to_dynamic(entity.scale));
    map.insert("visible".into(), entity.visible.into());
    map.insert(
        "data".into(),
        json_to_dynamic(&Value::Object(entity.data.clone())),
    );
    Dynamic::from_map(map)
}

fn context_to_dynamic(ctx: &HookContext) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("delta_time".into(), (ctx.delta_time as rhai::FLOAT).into());
    map.insert("total_time".into(), (ctx.total_time as rhai::FLOAT).into());
    map.insert("component_id".into(), ctx.component.id.clone().into());
    map.insert(
        "params".into(),
        json_to_dynamic(&Value::Object(ctx.component.parameters.clone())),
    );
    Dynamic::from_map(map)
}

fn dynamic_number(d: &Dynamic) -> Option<f32> {
    d.as_float()
        .ok()
        .map(|f| f as f32)
        .or_else(|| d.as_int().ok().map(|i| i as f32))
}

fn read_vec3(map: &rhai::Map, key: &str, target: &mut Vec3) -> Result<(), String> {
    let Some(value) = map.get(key) else {
        return Ok(());
    };
    let inner = value
        .read_lock::<rhai::Map>()
        .ok_or_else(|| format!("'{}' is no longer a map", key))?;
    for axis in ["x", "y", "z"] {
        if let Some(component) = inner.get(axis) {
            let n = dynamic_number(component)
                .ok_or_else(|| format!("'{}.{}' is not a number", key, axis))?;
            if let Some(slot) = target.axis_mut(axis) {
                *slot = n;
            }
        }
    }
    Ok(())
}

/// Copy script-visible fields back into the entity. `id` is not writable.
fn write_back_entity(this: &Dynamic, entity: &mut ScriptEntity) -> Result<(), String> {
    let map = this
        .read_lock::<rhai::Map>()
        .ok_or_else(|| "`this` is no longer a map".to_string())?;
    read_vec3(&map, "position", &mut entity.position)?;
    read_vec3(&map, "rotation", &mut entity.rotation)?;
    read_vec3(&map, "scale", &mut entity.scale)?;
    if let Some(visible) = map.get("visible") {
        entity.visible = visible
            .as_bool()
            .map_err(|_| "'visible' is not a bool".to_string())?;
    }
    if let Some(name) = map.get("name") {
        if let Ok(name) = name.clone().into_string() {
            entity.name = name;
        }
    }
    if let Some(data) = map.get("data") {
        match rhai::serde::from_dynamic::<Value>(data) {
            Ok(Value::Object(data)) => entity.data = data,
            Ok(_) => return Err("'data' is no longer a map".into()),
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}
