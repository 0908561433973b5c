//! Application root: owns the script registry, the router and the
//! receiving end of the broker's scene channel.

use crate::lifecycle::FrameReport;
use crate::protocol::LiveUpdate;
use crate::router::Router;
use crate::script::{ScriptEngine, ScriptExecutor, ScriptRegistry};
use crate::types::ScriptConfig;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct GameApp {
    registry: Arc<ScriptRegistry>,
    router: Router,
    updates: Option<UnboundedReceiver<LiveUpdate>>,
}

impl GameApp {
    /// Rhai-backed app with its own engine.
    pub fn new(config: &ScriptConfig) -> Self {
        let registry = Arc::new(ScriptRegistry::new(Arc::new(ScriptEngine::new(config))));
        let router = Router::with_rhai(registry.clone());
        Self {
            registry,
            router,
            updates: None,
        }
    }

    pub fn with_executor(registry: Arc<ScriptRegistry>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            router: Router::new(registry.clone(), executor),
            registry,
            updates: None,
        }
    }

    /// Attach the scene side of a broker.
    pub fn connect(&mut self, updates: UnboundedReceiver<LiveUpdate>) {
        self.updates = Some(updates);
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Apply every live update received so far; returns how many arrived.
    pub fn drain_updates(&mut self) -> usize {
        let Some(rx) = self.updates.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(update) = rx.try_recv() {
            self.router.apply_live_update(&update);
            count += 1;
        }
        count
    }

    /// One frame: live updates first, then the active scene's scripts.
    pub async fn frame(&mut self, delta_time: f32) -> FrameReport {
        self.drain_updates();
        self.router.frame(delta_time).await
    }
}
