//! Error taxonomy.
//!
//! Every error except [`RouterError`] is contained at the granularity where
//! it happens (one script invocation, one broker cycle, one client send) and
//! only logged there.

use thiserror::Error;

/// Script source failed to produce valid hooks. Surfaced through
/// `CompiledScript::last_error`, never thrown at callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("syntax error in script '{script}': {message}")]
    Syntax { script: String, message: String },
    #[error("hook '{hook}' in script '{script}' takes {arity} parameters, expected at most 1")]
    HookSignature {
        script: String,
        hook: String,
        arity: usize,
    },
}

/// A lifecycle hook failed while running.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HookError {
    #[error("script '{script}' hook '{hook}' failed: {message}")]
    Runtime {
        script: String,
        hook: &'static str,
        message: String,
    },
    #[error("script '{script}' hook '{hook}' returned an entity the engine could not read: {message}")]
    EntityDecode {
        script: String,
        hook: &'static str,
        message: String,
    },
    #[error("script '{script}' has no compiled program")]
    NotCompiled { script: String },
}

/// Navigation failed. The only error that reaches its caller.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no route matches '{0}'")]
    RouteNotFound(String),
    #[error("failed to load scene for route '{route}': {message}")]
    SceneLoad { route: String, message: String },
    #[error("scene for '{route}' failed to activate: {source}")]
    Activation {
        route: String,
        #[source]
        source: SceneError,
    },
}

/// Property application or object-tree edit rejected by a scene.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SceneError {
    #[error("no object with id '{0}'")]
    ObjectNotFound(String),
    #[error("object id '{0}' already exists in the scene")]
    DuplicateId(String),
    #[error("unknown property '{0}'")]
    UnknownProperty(String),
    #[error("invalid value for '{property}': {message}")]
    InvalidValue { property: String, message: String },
    #[error("{0}")]
    Hook(String),
}

/// Read, parse or write failure on a persisted scene/override file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not serialise '{path}': {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A send to an editor client failed; that client gets pruned.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client {0} is disconnected")]
    Closed(u64),
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
