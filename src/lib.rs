//! Scene Live
//!
//! Per-entity script lifecycle and editor live-sync for a scene-based game
//! engine.
//!
//! ## Architecture
//!
//! ```text
//! GameApp  (app.rs)
//!   ├── ScriptRegistry  (script.rs)     ← compile, revisions, errors
//!   └── Router  (router.rs)             ← route match, scene cache, history
//!         └── Scene  (scene.rs)         ← object tree, properties, overrides
//!               └── ScriptManager  (lifecycle.rs) ← phases, isolation
//!
//! LiveUpdateBroker  (broker.rs)  ── scene channel ──► GameApp
//!   ├── OverrideWatcher  (watch.rs)     ← notify
//!   ├── EditorListener  (transport.rs)  ← TCP, newline JSON
//!   └── SceneStore  (store.rs)          ← override files
//! ```
//!
//! The wire protocol, the shared data model and the diff engine are usable
//! without the `server` feature.

// Always available (no server feature needed).
pub mod diff;
pub mod error;
pub mod protocol;
pub mod types;

// Runtime modules require the `server` feature.
#[cfg(feature = "server")]
pub mod app;
#[cfg(feature = "server")]
pub mod broker;
#[cfg(feature = "server")]
pub mod lifecycle;
#[cfg(feature = "server")]
pub mod router;
#[cfg(feature = "server")]
pub mod scene;
#[cfg(feature = "server")]
pub mod script;
#[cfg(feature = "server")]
pub mod settings;
#[cfg(feature = "server")]
pub mod store;
#[cfg(feature = "server")]
pub mod transport;
#[cfg(feature = "server")]
pub mod watch;

// Convenience re-exports (server only)
#[cfg(feature = "server")]
pub use app::GameApp;
#[cfg(feature = "server")]
pub use broker::{BrokerInput, LiveUpdateBroker};
#[cfg(feature = "server")]
pub use lifecycle::{FrameReport, ScriptManager};
#[cfg(feature = "server")]
pub use router::{Router, SceneFactory, SceneRef};
#[cfg(feature = "server")]
pub use scene::{PropertyTable, Scene, SceneBehavior, SceneState, SceneTree};
#[cfg(feature = "server")]
pub use script::{CompiledScript, Hook, ScriptDefinition, ScriptEngine, ScriptRegistry};
#[cfg(feature = "server")]
pub use settings::Settings;
#[cfg(feature = "server")]
pub use store::{FsStore, MemoryStore, SceneStore};

pub use diff::{classify, diff as diff_documents, ClassifiedDiff, DiffEntry, DiffKind};
pub use error::{CompileError, HookError, PersistenceError, RouterError, SceneError, TransportError};
pub use protocol::LiveUpdate;
pub use types::{
    BrokerConfig, BrokerStats, ComponentRecord, SceneObjectNode, ScriptComponent, ScriptConfig,
    ScriptStats, Transform, Vec3,
};
