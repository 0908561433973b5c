//! Live-update wire protocol.
//!
//! This module owns **every message that crosses the editor boundary**
//! between the broker, external editor connections and the running scene.
//!
//! ## Message kinds
//!
//! | `type`            | Direction                  | Meaning                          |
//! |-------------------|----------------------------|----------------------------------|
//! | `property-update` | editor ⇄ broker → scene    | set one dotted property          |
//! | `scene-reload`    | broker → scene, editors    | full object-tree re-sync         |
//! | *anything else*   | –                          | ignored by every receiver        |
//!
//! ## Design rules
//!
//! 1. JSON keys are camelCase (`scenePath`, `routePath`).
//! 2. `property` or `type` must be present; everything else is optional.
//! 3. `temporary` defaults to `false`. Temporary updates are previews and
//!    are never persisted.
//! 4. Unknown `type` values are not errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// All `type` discriminators used by the protocol, as constants.
pub mod kinds {
    pub const PROPERTY_UPDATE: &str = "property-update";
    pub const SCENE_RELOAD: &str = "scene-reload";
    pub const PING: &str = "ping";
}

/// What a receiver should do with a [`LiveUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// Apply `value` at the dotted `property` path.
    Property,
    /// Rebuild the object tree and re-apply the override document in `value`.
    Reload,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_path: Option<String>,
    /// Dotted property path (`cubeColor`, `scene.objects.cube.position.x`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub temporary: bool,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl LiveUpdate {
    pub fn property_update(
        scene_path: impl Into<String>,
        property: impl Into<String>,
        value: Value,
        temporary: bool,
    ) -> Self {
        Self {
            kind: Some(kinds::PROPERTY_UPDATE.into()),
            scene_path: Some(scene_path.into()),
            route_path: None,
            property: Some(property.into()),
            value,
            temporary,
            timestamp: now_millis(),
        }
    }

    pub fn scene_reload(scene_path: impl Into<String>, document: Value) -> Self {
        Self {
            kind: Some(kinds::SCENE_RELOAD.into()),
            scene_path: Some(scene_path.into()),
            route_path: None,
            property: None,
            value: document,
            temporary: false,
            timestamp: now_millis(),
        }
    }

    pub fn with_route(mut self, route_path: impl Into<String>) -> Self {
        self.route_path = Some(route_path.into());
        self
    }

    /// Classify the message, or `None` if receivers should ignore it.
    ///
    /// A `property` field makes any message a property update, whatever its
    /// `type` says.
    pub fn action(&self) -> Option<UpdateAction> {
        if self.property.is_some() || self.kind.as_deref() == Some(kinds::PROPERTY_UPDATE) {
            return self.property.as_ref().map(|_| UpdateAction::Property);
        }
        match self.kind.as_deref() {
            Some(kinds::SCENE_RELOAD) => Some(UpdateAction::Reload),
            _ => None,
        }
    }

    /// True when the update should be written back to the override file.
    pub fn is_persistable(&self) -> bool {
        !self.temporary && self.scene_path.is_some() && self.property.is_some()
    }

    /// Does this update address the scene identified by either path?
    pub fn targets(&self, scene_path: &str, route_path: &str) -> bool {
        self.scene_path.as_deref() == Some(scene_path)
            || self.route_path.as_deref() == Some(route_path)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
