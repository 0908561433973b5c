//! Scene Router/Cache – resolves a navigation path to a live scene.
//!
//! ## Navigation order
//!
//! ```text
//! navigate(path)
//!   previous:  on_exit (errors logged) → clear registry → cleanup → script teardown
//!   resolve:   exact route → `[param]` segment match → RouteNotFound
//!   target:    cached ? reuse (clear registry, set route) : load + insert into cache
//!   activate:  params → init → queued updates → on_enter → bookkeeping → history
//! ```
//!
//! Cached scenes live until [`Router::reload_project`]. The router must not be
//! re-entered while a `navigate` is pending; `&mut self` enforces that.

use crate::error::RouterError;
use crate::lifecycle::{FrameReport, ScriptManager};
use crate::protocol::LiveUpdate;
use crate::scene::{RouteParams, Scene, SceneBehavior};
use crate::script::{RhaiExecutor, ScriptExecutor, ScriptRegistry};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type SceneRef = Arc<Mutex<Scene>>;

// ---------------------------------------------------------------------------
// Scene loading
// ---------------------------------------------------------------------------

/// Produces a fresh behavior for a route, possibly asynchronously.
pub trait SceneFactory: Send + Sync {
    fn load(&self) -> BoxFuture<'static, Result<Box<dyn SceneBehavior>, String>>;
}

impl<F> SceneFactory for F
where
    F: Fn() -> Box<dyn SceneBehavior> + Send + Sync,
{
    fn load(&self) -> BoxFuture<'static, Result<Box<dyn SceneBehavior>, String>> {
        Box::pin(futures::future::ready(Ok(self())))
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct RouteDef {
    pattern: String,
    segments: Vec<Segment>,
    scene_path: String,
    factory: Arc<dyn SceneFactory>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    split_path(pattern)
        .into_iter()
        .map(|seg| match seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
            _ => Segment::Literal(seg.to_string()),
        })
        .collect()
}

impl RouteDef {
    /// Positional match; each `[param]` takes exactly one whole segment.
    fn match_segments(&self, path: &str) -> Option<RouteParams> {
        let parts = split_path(path);
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = RouteParams::new();
        for (seg, part) in self.segments.iter().zip(parts) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NavigateOptions {
    /// The navigation replays a history pop; history is not pushed.
    pub from_history: bool,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    routes: Vec<RouteDef>,
    cache: HashMap<String, SceneRef>,
    current: Option<(String, SceneRef)>,
    history: Vec<String>,
    registry: Arc<ScriptRegistry>,
    executor: Arc<dyn ScriptExecutor>,
}

impl Router {
    pub fn new(registry: Arc<ScriptRegistry>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            routes: Vec::new(),
            cache: HashMap::new(),
            current: None,
            history: Vec::new(),
            registry,
            executor,
        }
    }

    pub fn with_rhai(registry: Arc<ScriptRegistry>) -> Self {
        let executor = Arc::new(RhaiExecutor::new(registry.engine()));
        Self::new(registry, executor)
    }

    /// Register a route pattern (`/levels/[id]`) served by `scene_path`.
    pub fn register(
        &mut self,
        pattern: &str,
        scene_path: &str,
        factory: impl SceneFactory + 'static,
    ) {
        self.routes.push(RouteDef {
            pattern: pattern.to_string(),
            segments: parse_pattern(pattern),
            scene_path: scene_path.to_string(),
            factory: Arc::new(factory),
        });
    }

    fn resolve(&self, path: &str) -> Result<(&RouteDef, RouteParams), RouterError> {
        if let Some(route) = self.routes.iter().find(|r| r.pattern == path) {
            return Ok((route, route.match_segments(path).unwrap_or_default()));
        }
        self.routes
            .iter()
            .find_map(|r| r.match_segments(path).map(|params| (r, params)))
            .ok_or_else(|| RouterError::RouteNotFound(path.to_string()))
    }

    pub fn current(&self) -> Option<SceneRef> {
        self.current.as_ref().map(|(_, scene)| scene.clone())
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current.as_ref().map(|(path, _)| path.as_str())
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn cached(&self, path: &str) -> Option<SceneRef> {
        self.cache.get(path).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    pub async fn navigate(&mut self, path: &str) -> Result<SceneRef, RouterError> {
        self.navigate_with(path, NavigateOptions::default()).await
    }

    pub async fn navigate_with(
        &mut self,
        path: &str,
        options: NavigateOptions,
    ) -> Result<SceneRef, RouterError> {
        if let Some((prev_path, prev)) = self.current.take() {
            deactivate(&prev_path, &prev).await;
        }

        let (scene_path, factory, params) = {
            let (route, params) = self.resolve(path)?;
            (route.scene_path.clone(), route.factory.clone(), params)
        };

        let scene = match self.cache.get(path) {
            Some(scene) => {
                debug!("Reusing cached scene for '{}'", path);
                let mut s = scene.lock();
                s.clear_registry();
                s.set_route(path);
                drop(s);
                scene.clone()
            }
            None => {
                let behavior = factory.load().await.map_err(|message| RouterError::SceneLoad {
                    route: path.to_string(),
                    message,
                })?;
                let scripts = Arc::new(ScriptManager::new(
                    self.registry.clone(),
                    self.executor.clone(),
                ));
                let mut scene = Scene::new(scene_path, behavior, scripts);
                scene.set_route(path);
                let scene = Arc::new(Mutex::new(scene));
                self.cache.insert(path.to_string(), scene.clone());
                scene
            }
        };

        {
            let mut s = scene.lock();
            s.set_params(params);
            s.init();
            let applied = s.drain_pending();
            if applied > 0 {
                debug!("Applied {} queued updates to '{}'", applied, path);
            }
            s.enter().map_err(|source| RouterError::Activation {
                route: path.to_string(),
                source,
            })?;
        }

        self.current = Some((path.to_string(), scene.clone()));
        if !options.from_history {
            self.history.push(path.to_string());
        }
        info!("Navigated to '{}'", path);
        Ok(scene)
    }

    /// Pop the current history entry and navigate to the previous one.
    pub async fn back(&mut self) -> Result<Option<SceneRef>, RouterError> {
        if self.history.len() < 2 {
            return Ok(None);
        }
        self.history.pop();
        let Some(target) = self.history.last().cloned() else {
            return Ok(None);
        };
        let options = NavigateOptions { from_history: true };
        self.navigate_with(&target, options).await.map(Some)
    }

    /// Dispose every cached scene (explicit project reload).
    pub async fn reload_project(&mut self) {
        if let Some((path, scene)) = self.current.take() {
            deactivate(&path, &scene).await;
        }
        for (path, scene) in self.cache.drain() {
            let scripts = scene.lock().scripts();
            scripts.teardown().await;
            debug!("Disposed cached scene '{}'", path);
        }
        info!("Project reloaded; scene cache cleared");
    }

    // -----------------------------------------------------------------------
    // Live updates & frames
    // -----------------------------------------------------------------------

    /// Apply to the active scene now; queue for cached, inactive scenes.
    /// Untargeted updates go to the active scene only.
    pub fn apply_live_update(&self, update: &LiveUpdate) -> usize {
        let mut touched = 0;
        let untargeted = update.scene_path.is_none() && update.route_path.is_none();
        if let Some((_, active)) = &self.current {
            let mut scene = active.lock();
            let state = scene.state();
            if untargeted || update.targets(&state.scene_path, &state.route_path) {
                if let Err(e) = scene.apply_update(update) {
                    warn!("Live update rejected by '{}': {}", state_label(&scene), e);
                }
                touched += 1;
            }
        }
        if untargeted {
            return touched;
        }
        for (path, cached) in &self.cache {
            if self.current_path() == Some(path.as_str()) {
                continue;
            }
            let mut scene = cached.lock();
            let state = scene.state();
            if update.targets(&state.scene_path, &state.route_path) {
                scene.queue_update(update.clone());
                touched += 1;
            }
        }
        touched
    }

    /// Tick the active scene's scripts between the two sync points.
    pub async fn frame(&self, delta_time: f32) -> FrameReport {
        let Some((_, scene)) = &self.current else {
            return FrameReport::default();
        };
        let scripts = {
            let mut s = scene.lock();
            s.sync_scripts();
            s.scripts()
        };
        let report = scripts.tick(delta_time).await;
        if report.ran {
            scene.lock().write_back_scripts();
        }
        report
    }
}

fn state_label(scene: &Scene) -> String {
    scene.state().route_path.clone()
}

/// Exit, clear registry, cleanup, in that order. An exit error is logged
/// and cleanup still runs.
async fn deactivate(path: &str, scene: &SceneRef) {
    let scripts = {
        let mut s = scene.lock();
        if let Err(e) = s.exit() {
            warn!("Exit hook of '{}' failed: {}", path, e);
        }
        s.clear_registry();
        s.cleanup();
        s.scripts()
    };
    scripts.teardown().await;
}
