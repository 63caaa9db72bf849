//! Participant identity and per-connection presence entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::element::{null_as_default, null_as_true};

/// Server-assigned identifier of one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a user is, independent of how many sockets they hold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantIdentity {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub initials: String,
    #[serde(deserialize_with = "null_as_default")]
    pub color: String,
}

impl ParticipantIdentity {
    /// Fresh identity with a random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name)
    }

    /// Identity for a known id; initials and color are derived.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let name = name.into();
        Self {
            initials: initials_for(&name),
            color: color_for(&id),
            id,
            name,
        }
    }
}

/// One entry of a room's presence list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Participant {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub initials: String,
    #[serde(deserialize_with = "null_as_default")]
    pub color: String,
    #[serde(deserialize_with = "null_as_default")]
    pub connection_id: ConnectionId,
    #[serde(deserialize_with = "null_as_true")]
    pub is_active: bool,
}

impl Default for Participant {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            initials: String::new(),
            color: String::new(),
            connection_id: ConnectionId::default(),
            is_active: true,
        }
    }
}

impl Participant {
    pub fn new(identity: ParticipantIdentity, connection_id: ConnectionId) -> Self {
        Self {
            id: identity.id,
            name: identity.name,
            initials: identity.initials,
            color: identity.color,
            connection_id,
            is_active: true,
        }
    }

    pub fn identity(&self) -> ParticipantIdentity {
        ParticipantIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
            initials: self.initials.clone(),
            color: self.color.clone(),
        }
    }
}

/// First letter of up to two words, upper-cased. `"?"` for blank names.
pub fn initials_for(name: &str) -> String {
    let initials: String = name
        .split_whitespace()
        .take(2)
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials
    }
}

/// Stable, vivid `#rrggbb` color for an id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every participant is equally readable on a light canvas.
pub fn color_for(id: &str) -> String {
    let hash = id.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    });
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
