//! Script Lifecycle Manager – drives per-entity scripts through the frame.
//!
//! ## Frame pass
//!
//! ```text
//! tick(dt)
//!   ├─ sync point: destroy hooks of components detached since last tick
//!   ├─ init        (newly eligible instances only)   ─┐
//!   ├─ update      (every initialized + enabled)      │ each phase is
//!   ├─ lateUpdate                                     │ fire-and-collect,
//!   └─ fixedUpdate                                   ─┘ joined before the next
//! ```
//!
//! A tick that arrives while the previous one is still pending is dropped,
//! not queued. One failing hook never stops its siblings.

use crate::error::HookError;
use crate::script::{
    CompiledScript, EntityHandle, Hook, HookContext, RhaiExecutor, ScriptEntity, ScriptExecutor,
    ScriptRegistry,
};
use crate::types::{SceneObjectNode, ScriptComponent, ScriptStats};
use futures::future::join_all;
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Per-attachment state
// ---------------------------------------------------------------------------

/// One (entity, script component) attachment.
#[derive(Debug, Clone)]
struct InstanceState {
    component: Arc<ScriptComponent>,
    initialized: bool,
    /// Revision the instance was initialized against.
    revision: u64,
    /// Set when `init` failed; cleared only by a new script revision.
    init_failed: Option<u64>,
    attach_seq: u64,
}

impl InstanceState {
    fn new(component: ScriptComponent, attach_seq: u64) -> Self {
        Self {
            component: Arc::new(component),
            initialized: false,
            revision: 0,
            init_failed: None,
            attach_seq,
        }
    }
}

struct EntitySlot {
    handle: EntityHandle,
    instances: Vec<InstanceState>,
}

/// A detached instance waiting for its `destroy` hook.
struct Detached {
    entity: EntityHandle,
    component: Arc<ScriptComponent>,
}

#[derive(Default)]
struct ManagerState {
    entities: BTreeMap<String, EntitySlot>,
    detached: Vec<Detached>,
    total_time: f64,
    attach_seq: u64,
    frames_run: u64,
    frames_skipped: u64,
}

/// Outcome of one [`ScriptManager::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// False when the tick was dropped because a pass was still in flight.
    pub ran: bool,
    pub invoked: usize,
    pub failed: usize,
}

/// Key identifying an instance across a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InstanceKey {
    entity_id: String,
    component_id: String,
}

struct Invocation {
    key: InstanceKey,
    script: Arc<CompiledScript>,
    ctx: HookContext,
    order: (i32, u64),
}

/// Clears the in-flight flag when a pass ends, even if its future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// ScriptManager
// ---------------------------------------------------------------------------

pub struct ScriptManager {
    registry: Arc<ScriptRegistry>,
    executor: Arc<dyn ScriptExecutor>,
    state: Mutex<ManagerState>,
    in_flight: AtomicBool,
}

impl ScriptManager {
    pub fn new(registry: Arc<ScriptRegistry>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            registry,
            executor,
            state: Mutex::new(ManagerState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Manager running hooks on the registry's own Rhai engine.
    pub fn with_rhai(registry: Arc<ScriptRegistry>) -> Self {
        let executor = Arc::new(RhaiExecutor::new(registry.engine()));
        Self::new(registry, executor)
    }

    // -----------------------------------------------------------------------
    // Entities & attachments
    // -----------------------------------------------------------------------

    /// Register an entity; returns the existing handle if already known.
    pub fn add_entity(&self, entity: ScriptEntity) -> EntityHandle {
        let mut st = self.state.lock();
        st.entities
            .entry(entity.id.clone())
            .or_insert_with(|| EntitySlot {
                handle: Arc::new(Mutex::new(entity)),
                instances: Vec::new(),
            })
            .handle
            .clone()
    }

    pub fn entity(&self, entity_id: &str) -> Option<EntityHandle> {
        self.state
            .lock()
            .entities
            .get(entity_id)
            .map(|slot| slot.handle.clone())
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.state.lock().entities.keys().cloned().collect()
    }

    /// Drop an entity; its initialized scripts are destroyed at the next sync
    /// point.
    pub fn remove_entity(&self, entity_id: &str) -> bool {
        let mut st = self.state.lock();
        let Some(slot) = st.entities.remove(entity_id) else {
            return false;
        };
        for instance in slot.instances {
            if instance.initialized {
                st.detached.push(Detached {
                    entity: slot.handle.clone(),
                    component: instance.component,
                });
            }
        }
        true
    }

    /// Attach a script component. Rejected if the entity is unknown or the
    /// component id is already attached to it.
    pub fn attach(&self, entity_id: &str, component: ScriptComponent) -> bool {
        let mut st = self.state.lock();
        st.attach_seq += 1;
        let seq = st.attach_seq;
        let Some(slot) = st.entities.get_mut(entity_id) else {
            warn!("Cannot attach script to unknown entity '{}'", entity_id);
            return false;
        };
        if slot.instances.iter().any(|i| i.component.id == component.id) {
            return false;
        }
        debug!(
            "Attached script '{}' as {} on '{}'",
            component.script_id, component.id, entity_id
        );
        slot.instances.push(InstanceState::new(component, seq));
        true
    }

    /// Detach a script component. Its state is discarded; if it was
    /// initialized, `destroy` runs at the next sync point.
    pub fn detach(&self, entity_id: &str, component_id: &str) -> bool {
        let mut st = self.state.lock();
        let Some(slot) = st.entities.get_mut(entity_id) else {
            return false;
        };
        let Some(pos) = slot
            .instances
            .iter()
            .position(|i| i.component.id == component_id)
        else {
            return false;
        };
        let instance = slot.instances.remove(pos);
        let handle = slot.handle.clone();
        if instance.initialized {
            st.detached.push(Detached {
                entity: handle,
                component: instance.component,
            });
        }
        true
    }

    /// Freeze or resume one attachment. Disabling never calls `destroy`.
    pub fn set_component_enabled(&self, entity_id: &str, component_id: &str, enabled: bool) -> bool {
        self.update_component(entity_id, component_id, |c| c.enabled = enabled)
    }

    pub fn set_time_scale(&self, entity_id: &str, component_id: &str, time_scale: f32) -> bool {
        self.update_component(entity_id, component_id, |c| c.time_scale = time_scale)
    }

    fn update_component(
        &self,
        entity_id: &str,
        component_id: &str,
        edit: impl FnOnce(&mut ScriptComponent),
    ) -> bool {
        let mut st = self.state.lock();
        let Some(instance) = st
            .entities
            .get_mut(entity_id)
            .and_then(|slot| slot.instances.iter_mut().find(|i| i.component.id == component_id))
        else {
            return false;
        };
        let mut component = (*instance.component).clone();
        edit(&mut component);
        instance.component = Arc::new(component);
        true
    }

    /// Sync point with the scene: copy the node's transform in and reconcile
    /// its script components (attach new, detach missing, refresh the rest).
    pub fn sync_entity(&self, node: &SceneObjectNode) {
        let handle = self.add_entity(ScriptEntity::new(node.id.clone(), node.name.clone()));
        {
            let mut entity = handle.lock();
            entity.name = node.name.clone();
            entity.position = node.transform.position;
            entity.rotation = node.transform.rotation;
            entity.scale = node.transform.scale;
            entity.visible = node.visible;
        }

        let wanted = node.script_components();
        let existing: Vec<String> = {
            let st = self.state.lock();
            st.entities
                .get(&node.id)
                .map(|slot| slot.instances.iter().map(|i| i.component.id.clone()).collect())
                .unwrap_or_default()
        };

        for id in &existing {
            if !wanted.iter().any(|c| &c.id == id) {
                self.detach(&node.id, id);
            }
        }
        for component in wanted {
            if existing.contains(&component.id) {
                let fresh = component.clone();
                self.update_component(&node.id, &component.id, move |c| *c = fresh);
            } else {
                self.attach(&node.id, component);
            }
        }
    }

    /// Copy script-driven transform changes back onto the scene node.
    pub fn write_back(&self, node: &mut SceneObjectNode) {
        if let Some(handle) = self.entity(&node.id) {
            let entity = handle.lock();
            node.transform.position = entity.position;
            node.transform.rotation = entity.rotation;
            node.transform.scale = entity.scale;
            node.visible = entity.visible;
        }
    }

    pub fn is_initialized(&self, entity_id: &str, component_id: &str) -> Option<bool> {
        let st = self.state.lock();
        st.entities
            .get(entity_id)?
            .instances
            .iter()
            .find(|i| i.component.id == component_id)
            .map(|i| i.initialized)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ScriptStats {
        let st = self.state.lock();
        let instances = st.entities.values().map(|s| s.instances.len()).sum();
        let initialized = st
            .entities
            .values()
            .flat_map(|s| s.instances.iter())
            .filter(|i| i.initialized)
            .count();
        ScriptStats {
            entities: st.entities.len(),
            instances,
            initialized,
            frames_run: st.frames_run,
            frames_skipped: st.frames_skipped,
        }
    }

    // -----------------------------------------------------------------------
    // Frame pass
    // -----------------------------------------------------------------------

    /// Run one frame. Returns `ran == false` without invoking anything if the
    /// previous pass has not settled yet.
    pub async fn tick(&self, delta_time: f32) -> FrameReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.state.lock().frames_skipped += 1;
            debug!("Frame dropped: previous pass still in flight");
            return FrameReport::default();
        }
        let _guard = InFlight(&self.in_flight);

        let mut report = FrameReport {
            ran: true,
            ..Default::default()
        };

        self.run_detached(&mut report).await;

        let total_time = {
            let mut st = self.state.lock();
            st.frames_run += 1;
            st.total_time += delta_time as f64;
            st.total_time
        };

        let inits = self.collect_init(delta_time, total_time);
        let outcomes = self.run_phase(inits, &mut report).await;
        self.record_init(outcomes);

        for hook in [Hook::Update, Hook::LateUpdate, Hook::FixedUpdate] {
            let calls = self.collect(hook, delta_time, total_time);
            self.run_phase(calls, &mut report).await;
        }

        report
    }

    /// Full scene teardown: destroy every initialized instance but keep the
    /// states, reset to uninitialized, so a cached scene can re-init them.
    pub async fn teardown(&self) -> FrameReport {
        let mut report = FrameReport {
            ran: true,
            ..Default::default()
        };
        self.run_detached(&mut report).await;

        let calls: Vec<Invocation> = {
            let mut st = self.state.lock();
            let total_time = st.total_time;
            let mut calls = Vec::new();
            for (entity_id, slot) in st.entities.iter_mut() {
                for instance in slot.instances.iter_mut() {
                    if !instance.initialized {
                        continue;
                    }
                    instance.initialized = false;
                    if let Some(script) = self.registry.get(&instance.component.script_id) {
                        if script.has_hook(Hook::Destroy) {
                            calls.push(invocation(
                                entity_id,
                                slot.handle.clone(),
                                instance,
                                script,
                                Hook::Destroy,
                                0.0,
                                total_time,
                            ));
                        }
                    }
                }
            }
            calls
        };
        let count = calls.len();
        self.run_phase(calls, &mut report).await;
        info!("Script teardown complete ({} destroy hooks)", count);
        report
    }

    /// Explicit sync point: run pending `destroy` hooks without a frame.
    pub async fn flush_detached(&self) -> FrameReport {
        let mut report = FrameReport {
            ran: true,
            ..Default::default()
        };
        self.run_detached(&mut report).await;
        report
    }

    /// Run `destroy` for everything detached since the last sync point.
    async fn run_detached(&self, report: &mut FrameReport) {
        let (detached, total_time) = {
            let mut st = self.state.lock();
            (std::mem::take(&mut st.detached), st.total_time)
        };
        if detached.is_empty() {
            return;
        }
        let calls: Vec<Invocation> = detached
            .into_iter()
            .filter_map(|d| {
                let script = self.registry.get(&d.component.script_id)?;
                if !script.has_hook(Hook::Destroy) {
                    return None;
                }
                let entity_id = d.entity.lock().id.clone();
                Some(Invocation {
                    key: InstanceKey {
                        entity_id,
                        component_id: d.component.id.clone(),
                    },
                    order: (script.priority, 0),
                    ctx: HookContext {
                        hook: Hook::Destroy,
                        delta_time: 0.0,
                        total_time,
                        component: d.component,
                        entity: d.entity,
                    },
                    script,
                })
            })
            .collect();
        self.run_phase(calls, report).await;
    }

    /// Instances eligible for `init` this frame. Also handles hot reloads:
    /// an initialized instance on a stale revision is re-armed for init, and
    /// an instance whose init failed on an older revision gets another try.
    fn collect_init(&self, delta_time: f32, total_time: f64) -> Vec<Invocation> {
        let mut st = self.state.lock();
        let mut calls = Vec::new();
        for (entity_id, slot) in st.entities.iter_mut() {
            for instance in slot.instances.iter_mut() {
                let Some(script) = self.registry.get(&instance.component.script_id) else {
                    continue;
                };
                if instance.initialized && instance.revision != script.revision {
                    info!(
                        "Script '{}' reloaded (rev {} -> {}), re-initializing {} on '{}'",
                        script.id, instance.revision, script.revision, instance.component.id, entity_id
                    );
                    instance.initialized = false;
                }
                if instance.initialized || instance.init_failed == Some(script.revision) {
                    continue;
                }
                if !(script.enabled && instance.component.enabled && instance.component.auto_start) {
                    continue;
                }
                if script.has_hook(Hook::Init) {
                    calls.push(invocation(
                        entity_id,
                        slot.handle.clone(),
                        instance,
                        script,
                        Hook::Init,
                        delta_time,
                        total_time,
                    ));
                } else {
                    instance.initialized = true;
                    instance.revision = script.revision;
                    instance.init_failed = None;
                }
            }
        }
        sort_calls(&mut calls);
        calls
    }

    fn record_init(&self, outcomes: Vec<(InstanceKey, u64, Result<(), HookError>)>) {
        let mut st = self.state.lock();
        for (key, revision, result) in outcomes {
            let Some(instance) = st
                .entities
                .get_mut(&key.entity_id)
                .and_then(|slot| {
                    slot.instances
                        .iter_mut()
                        .find(|i| i.component.id == key.component_id)
                })
            else {
                continue;
            };
            match result {
                Ok(()) => {
                    instance.initialized = true;
                    instance.revision = revision;
                    instance.init_failed = None;
                }
                Err(_) => instance.init_failed = Some(revision),
            }
        }
    }

    fn collect(&self, hook: Hook, delta_time: f32, total_time: f64) -> Vec<Invocation> {
        let st = self.state.lock();
        let mut calls = Vec::new();
        for (entity_id, slot) in st.entities.iter() {
            for instance in slot.instances.iter() {
                if !(instance.initialized && instance.component.enabled) {
                    continue;
                }
                let Some(script) = self.registry.get(&instance.component.script_id) else {
                    continue;
                };
                if !script.enabled || !script.has_hook(hook) {
                    continue;
                }
                calls.push(invocation(
                    entity_id,
                    slot.handle.clone(),
                    instance,
                    script,
                    hook,
                    delta_time,
                    total_time,
                ));
            }
        }
        drop(st);
        sort_calls(&mut calls);
        calls
    }

    /// Start every invocation, then wait for all of them. Errors and panics
    /// are contained per invocation.
    async fn run_phase(
        &self,
        calls: Vec<Invocation>,
        report: &mut FrameReport,
    ) -> Vec<(InstanceKey, u64, Result<(), HookError>)> {
        if calls.is_empty() {
            return Vec::new();
        }
        report.invoked += calls.len();

        let pending = calls.into_iter().map(|call| {
            let Invocation {
                key, script, ctx, ..
            } = call;
            let hook = ctx.hook;
            let script_id = script.id.clone();
            let revision = script.revision;
            let executor = self.executor.clone();
            async move {
                // Executors may do all their work before returning a future.
                let started =
                    std::panic::catch_unwind(AssertUnwindSafe(|| executor.invoke(script, ctx)));
                let outcome = match started {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                let result = outcome.unwrap_or_else(|_| {
                    Err(HookError::Runtime {
                        script: script_id,
                        hook: hook.name(),
                        message: "hook panicked".into(),
                    })
                });
                (key, revision, result)
            }
        });

        let outcomes = join_all(pending).await;
        for (key, _, result) in &outcomes {
            if let Err(e) = result {
                report.failed += 1;
                warn!("{} (component {} on '{}')", e, key.component_id, key.entity_id);
            }
        }
        outcomes
    }
}

fn invocation(
    entity_id: &str,
    entity: EntityHandle,
    instance: &InstanceState,
    script: Arc<CompiledScript>,
    hook: Hook,
    delta_time: f32,
    total_time: f64,
) -> Invocation {
    Invocation {
        key: InstanceKey {
            entity_id: entity_id.to_string(),
            component_id: instance.component.id.clone(),
        },
        order: (script.priority, instance.attach_seq),
        ctx: HookContext {
            hook,
            delta_time: delta_time * instance.component.time_scale,
            total_time,
            component: instance.component.clone(),
            entity,
        },
        script,
    }
}

/// Ascending priority, ties in attachment order.
fn sort_calls(calls: &mut [Invocation]) {
    calls.sort_by_key(|c| c.order);
}
