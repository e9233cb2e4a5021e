use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One shared map as the server publishes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapEntity {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridSpec>,
    #[serde(default)]
    pub show_grid_to_players: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSpec {
    pub x: f64,
    pub y: f64,
    pub side_length: f64,
}

/// A token on the map. Fields this core does not interpret (label, color,
/// radius, reference, ...) ride along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub is_visible_for_players: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Token {
    /// Shallow field-wise merge. Unknown fields land in `extra`, later values
    /// win, the id is never rewritten.
    pub fn merge_patch(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            match key.as_str() {
                "id" => {}
                "x" => {
                    if let Some(x) = value.as_f64() {
                        self.x = x;
                    }
                }
                "y" => {
                    if let Some(y) = value.as_f64() {
                        self.y = y;
                    }
                }
                "isVisibleForPlayers" => {
                    if let Some(visible) = value.as_bool() {
                        self.is_visible_for_players = visible;
                    }
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// A partial token update: the target id plus the changed fields, wire-shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPatch {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Ephemeral pointer marker; its visual lifetime is bounded by the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkedArea {
    pub id: String,
    pub x: f64,
    pub y: f64,
}
