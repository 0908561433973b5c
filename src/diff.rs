//! Scene Diff Engine – structural differences between two JSON documents.
//!
//! Works on parsed values (recursive key / index comparison), never on text.
//! Entries come out in a deterministic order: object keys are visited in
//! sorted order, arrays by index.
//!
//! ```text
//! diff(old, new) ──► [DiffEntry] ──► classify ──► properties  (targeted setters)
//!                                              └► structural  (`scene.*`, full reload)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Top-level key under which object-tree overrides live.
pub const SCENE_KEY: &str = "scene";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffKind {
    Create,
    Change,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: Vec<String>,
    pub kind: DiffKind,
    /// New value for `Create`/`Change`, the removed value for `Remove`.
    pub value: Value,
}

impl DiffEntry {
    /// The path joined with `.` – the property address used on the wire.
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }

    /// Object-tree changes live under the `scene` key and need a full
    /// reconciliation instead of a targeted setter.
    pub fn is_structural(&self) -> bool {
        self.path.first().map(String::as_str) == Some(SCENE_KEY)
    }
}

/// Diff entries split by downstream handling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedDiff {
    pub properties: Vec<DiffEntry>,
    pub structural: Vec<DiffEntry>,
}

impl ClassifiedDiff {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.structural.is_empty()
    }
}

pub fn diff(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut out);
    out
}

pub fn classify(entries: Vec<DiffEntry>) -> ClassifiedDiff {
    let (structural, properties) = entries.into_iter().partition(DiffEntry::is_structural);
    ClassifiedDiff {
        properties,
        structural,
    }
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<String>, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_objects(a, b, path, out),
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                path.push(i.to_string());
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => diff_into(x, y, path, out),
                    (None, Some(y)) => push(out, path, DiffKind::Create, y),
                    (Some(x), None) => push(out, path, DiffKind::Remove, x),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        (a, b) if a != b => push(out, path, DiffKind::Change, b),
        _ => {}
    }
}

fn diff_objects(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    path: &mut Vec<String>,
    out: &mut Vec<DiffEntry>,
) {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for key in keys {
        path.push(key.clone());
        match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => diff_into(x, y, path, out),
            (None, Some(y)) => push(out, path, DiffKind::Create, y),
            (Some(x), None) => push(out, path, DiffKind::Remove, x),
            (None, None) => {}
        }
        path.pop();
    }
}

fn push(out: &mut Vec<DiffEntry>, path: &[String], kind: DiffKind, value: &Value) {
    out.push(DiffEntry {
        path: path.to_vec(),
        kind,
        value: value.clone(),
    });
}

// ---------------------------------------------------------------------------
// Dotted-path helpers
// ---------------------------------------------------------------------------

/// Look up a dotted path (`scene.objects.cube.visible`) in a document.
pub fn get_dotted<'a>(doc: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at a dotted path, creating intermediate objects.
///
/// A `[x, y, z]` array addressed by axis becomes `{x, y, z}` so the other
/// two axes survive; an in-range index writes into an array element. Any
/// other non-object intermediate is replaced.
pub fn set_dotted(doc: &mut Value, dotted: &str, value: Value) {
    let mut segments = dotted.split('.').peekable();
    let mut cur = doc;
    while let Some(seg) = segments.next() {
        let last = segments.peek().is_none();
        if let Some(axes) = vector_as_object(cur, seg) {
            *cur = axes;
        }

        let index = match &*cur {
            Value::Array(items) => seg.parse::<usize>().ok().filter(|i| *i < items.len()),
            _ => None,
        };
        if let Some(i) = index {
            let Value::Array(items) = cur else {
                return;
            };
            if last {
                items[i] = value;
                return;
            }
            cur = &mut items[i];
            continue;
        }

        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else {
            return;
        };
        if last {
            map.insert(seg.to_string(), value);
            return;
        }
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

const AXES: [&str; 3] = ["x", "y", "z"];

fn vector_as_object(value: &Value, seg: &str) -> Option<Value> {
    match value {
        Value::Array(items)
            if AXES.contains(&seg) && items.len() == 3 && items.iter().all(Value::is_number) =>
        {
            Some(Value::Object(
                AXES.iter()
                    .map(|axis| axis.to_string())
                    .zip(items.iter().cloned())
                    .collect(),
            ))
        }
        _ => None,
    }
}

/// Remove a dotted path; returns the removed value.
pub fn remove_dotted(doc: &mut Value, dotted: &str) -> Option<Value> {
    let (parent, leaf) = match dotted.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, dotted),
    };
    let target = match parent {
        Some(p) => get_dotted_mut(doc, p)?,
        None => doc,
    };
    target.as_object_mut()?.remove(leaf)
}

fn get_dotted_mut<'a>(doc: &'a mut Value, dotted: &str) -> Option<&'a mut Value> {
    dotted
        .split('.')
        .try_fold(doc, |cur, seg| cur.as_object_mut()?.get_mut(seg))
}
