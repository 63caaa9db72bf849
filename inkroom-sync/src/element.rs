//! Drawing elements, scenes and the application-state blob.
//!
//! Only the attributes that take part in synchronization are typed.
//! Everything else the drawing surface attaches to an element (geometry,
//! stroke, text, bindings, …) rides along in [`Element::attributes`] and
//! round-trips untouched.
//!
//! Decoding is lenient: a peer running an older surface may omit stamps or
//! send them as strings. Missing or malformed numbers decode as `0`, a
//! missing tombstone flag as `false`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

// ───────────────────────────────────────────────────────────────────
// Element
// ───────────────────────────────────────────────────────────────────

/// The `(version, versionNonce)` pair that identifies one revision of an
/// element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionStamp {
    pub version: u64,
    pub version_nonce: i64,
}

/// One drawable object in a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Stable identity across edits.
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    /// Incremented by the surface on every mutation.
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u64,
    /// Random tiebreak regenerated on every mutation.
    #[serde(default, deserialize_with = "lenient_nonce")]
    pub version_nonce: i64,
    /// Wall-clock timestamp of the last mutation (ms since epoch).
    #[serde(
        default,
        deserialize_with = "lenient_updated",
        serialize_with = "integral_updated"
    )]
    pub updated: f64,
    /// Tombstone. Deleted elements stay in the scene so deletions propagate.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_deleted: bool,
    /// Every other attribute, carried opaquely.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Element {
    pub fn new(id: impl Into<String>, version: u64, version_nonce: i64, updated: f64) -> Self {
        Self {
            id: id.into(),
            version,
            version_nonce,
            updated,
            is_deleted: false,
            attributes: Map::new(),
        }
    }

    /// Mark as tombstoned (builder style).
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    /// Attach an opaque attribute (builder style).
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            version: self.version,
            version_nonce: self.version_nonce,
        }
    }

    /// A tombstoned element is carried but never drawn.
    #[inline]
    pub fn is_renderable(&self) -> bool {
        !self.is_deleted
    }
}

// ─── Lenient field decoding ───────────────────────────────────────

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_u64()
        .or_else(|| numeric(&value).filter(|n| *n >= 0.0).map(|n| n as u64))
        .unwrap_or(0))
}

fn lenient_nonce<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| numeric(&value).map(|n| n as i64))
        .unwrap_or(0))
}

fn lenient_updated<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(numeric(&Value::deserialize(deserializer)?).unwrap_or(0.0))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}

/// `null` decodes as the type's default, like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Activity flags: `null` means active.
pub(crate) fn null_as_true<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(true))
}

/// Element list where `null` is empty and non-object entries are skipped.
pub(crate) fn lenient_elements<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<Element>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(entries) => entries
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Millisecond timestamps are integers on the wire; keep them that way.
fn integral_updated<S: Serializer>(updated: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if updated.fract() == 0.0 && updated.abs() <= MAX_SAFE {
        serializer.serialize_i64(*updated as i64)
    } else {
        serializer.serialize_f64(*updated)
    }
}

// ───────────────────────────────────────────────────────────────────
// Scene
// ───────────────────────────────────────────────────────────────────

/// Ordered element collection keyed by id.
///
/// Ids are unique; insertion order is stable and an upsert of an existing id
/// replaces it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    elements: Vec<Element>,
    index: HashMap<String, usize>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scene; later duplicates of an id replace earlier ones in place.
    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        let mut scene = Self::new();
        for element in elements {
            scene.upsert(element);
        }
        scene
    }

    pub fn upsert(&mut self, element: Element) {
        match self.index.get(&element.id) {
            Some(&slot) => self.elements[slot] = element,
            None => {
                self.index.insert(element.id.clone(), self.elements.len());
                self.elements.push(element);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.index.get(id).map(|&slot| &self.elements[slot])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<Element> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether at least one element would be drawn.
    pub fn has_renderable(&self) -> bool {
        self.elements.iter().any(Element::is_renderable)
    }
}

/// Ordered, element-by-element comparison of id, version and nonce.
///
/// Used to recognise the change notification a surface emits when it is
/// hydrated with a freshly loaded scene.
pub fn same_stamps(a: &[Element], b: &[Element]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.id == y.id && x.stamp() == y.stamp())
}

// ───────────────────────────────────────────────────────────────────
// Application state
// ───────────────────────────────────────────────────────────────────

/// Opaque view state of the drawing surface (zoom, tool, colors, …).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState(pub Map<String, Value>);

impl AppState {
    pub const BACKGROUND: &'static str = "viewBackgroundColor";
    pub const GRID_SIZE: &'static str = "gridSize";
    pub const EXPORT_BACKGROUND: &'static str = "exportBackground";
    pub const DEFAULT_BACKGROUND: &'static str = "#ffffff";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// The subset that is written to storage: background color and grid size.
    pub fn persistable(&self) -> AppState {
        let mut kept = Map::new();
        for key in [Self::BACKGROUND, Self::GRID_SIZE] {
            if let Some(value) = self.0.get(key) {
                kept.insert(key.to_string(), value.clone());
            }
        }
        AppState(kept)
    }

    /// Fill the defaults a surface expects when loading a stored document.
    pub fn hydrate(persisted: AppState) -> AppState {
        let mut state = persisted;
        if state.get(Self::BACKGROUND).map_or(true, Value::is_null) {
            state.set(Self::BACKGROUND, Self::DEFAULT_BACKGROUND);
        }
        if !state.0.contains_key(Self::GRID_SIZE) {
            state.set(Self::GRID_SIZE, Value::Null);
        }
        state
    }

    /// App state handed to a preview renderer: background always exported.
    pub fn for_export(&self) -> AppState {
        let mut state = self.clone();
        state.set(Self::EXPORT_BACKGROUND, true);
        if state.get(Self::BACKGROUND).map_or(true, Value::is_null) {
            state.set(Self::BACKGROUND, Self::DEFAULT_BACKGROUND);
        }
        state
    }
}
