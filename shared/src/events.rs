use serde::{Deserialize, Serialize};

use crate::map::{MapEntity, Token, TokenPatch};

pub const MAP_UPDATE_EVENT: &str = "map update";
pub const FOG_UPDATE_EVENT: &str = "fog update";
pub const MARK_AREA_EVENT: &str = "mark area";
/// Token events arrive on a per-map event name: `token:<mapId>`.
pub const TOKEN_EVENT_PREFIX: &str = "token:";

/// Inbound push-channel events, normalized for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MapEvent {
    /// Full replace of the active map; `None` hides the map entirely.
    MapUpdate { map: Option<MapEntity> },
    /// The fog overlay of the named map changed; only it needs re-fetching.
    FogUpdate {
        #[serde(rename = "mapId")]
        map_id: String,
    },
    TokenOp {
        #[serde(rename = "mapId")]
        map_id: String,
        op: TokenOp,
    },
    MarkArea { id: String, x: f64, y: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TokenOp {
    Add {
        token: Token,
    },
    Update {
        token: TokenPatch,
    },
    Remove {
        #[serde(rename = "tokenId")]
        token_id: String,
    },
}

/// Events this client emits back onto the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    MarkArea { x: f64, y: f64 },
}

/// Map a named push-channel event to a `MapEvent`. Unknown names and
/// malformed payloads are reported as an error string; the engine classifies
/// them as protocol violations and keeps running.
pub fn parse_push_event(name: &str, payload: &str) -> Result<MapEvent, String> {
    if let Some(map_id) = name.strip_prefix(TOKEN_EVENT_PREFIX) {
        if map_id.is_empty() {
            return Err("token event without a map id".to_string());
        }
        let op: TokenOp = serde_json::from_str(payload)
            .map_err(|e| format!("malformed token event payload: {e}"))?;
        return Ok(MapEvent::TokenOp {
            map_id: map_id.to_string(),
            op,
        });
    }

    match name {
        MAP_UPDATE_EVENT => {
            #[derive(Deserialize)]
            struct MapUpdatePayload {
                #[serde(default)]
                map: Option<MapEntity>,
            }
            let payload: MapUpdatePayload = serde_json::from_str(payload)
                .map_err(|e| format!("malformed map update payload: {e}"))?;
            Ok(MapEvent::MapUpdate { map: payload.map })
        }
        FOG_UPDATE_EVENT => {
            #[derive(Deserialize)]
            struct FogUpdatePayload {
                #[serde(rename = "mapId")]
                map_id: String,
            }
            let payload: FogUpdatePayload = serde_json::from_str(payload)
                .map_err(|e| format!("malformed fog update payload: {e}"))?;
            Ok(MapEvent::FogUpdate {
                map_id: payload.map_id,
            })
        }
        MARK_AREA_EVENT => {
            #[derive(Deserialize)]
            struct MarkAreaPayload {
                id: String,
                x: f64,
                y: f64,
            }
            let payload: MarkAreaPayload = serde_json::from_str(payload)
                .map_err(|e| format!("malformed mark area payload: {e}"))?;
            Ok(MapEvent::MarkArea {
                id: payload.id,
                x: payload.x,
                y: payload.y,
            })
        }
        other => Err(format!("unknown push event: {other}")),
    }
}
