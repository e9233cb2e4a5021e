use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lantern_shared::{GridSpec, MapEntity, MarkedArea, Token};

use crate::image::DecodedImage;

/// The client's view of the shared map. `map` is populated only once a
/// session is ready (base and fog both decoded under the current generation),
/// so the image refs always belong to the exposed map id.
#[derive(Debug, Clone, Default)]
pub struct MapState {
    pub map: Option<MapEntity>,
    pub base_image: Option<Arc<DecodedImage>>,
    pub fog_image: Option<Arc<DecodedImage>>,
    pub marked_areas: Vec<MarkedArea>,
}

impl MapState {
    pub fn is_empty(&self) -> bool {
        self.map.is_none()
    }

    /// Tokens the renderer may show to players.
    pub fn visible_tokens(&self) -> Vec<&Token> {
        self.map
            .as_ref()
            .map(|map| {
                map.tokens
                    .iter()
                    .filter(|token| token.is_visible_for_players)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The grid, only when it is meant to be shown to players.
    pub fn player_grid(&self) -> Option<&GridSpec> {
        let map = self.map.as_ref()?;
        if map.show_grid_to_players {
            map.grid.as_ref()
        } else {
            None
        }
    }
}

/// What changed in the snapshot. Subscribers re-read via
/// `MapSync::snapshot()`; the notification only says why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotChange {
    MapReady,
    MapCleared,
    FogUpdated,
    TokensChanged,
    MarkedAreasChanged,
    /// A boundary call failed with an auth-class error; the host should move
    /// to its unauthenticated state.
    AuthRequired,
}

#[derive(Debug, Default)]
pub struct SyncCounters {
    events_dropped_while_hidden: AtomicU64,
    protocol_violations: AtomicU64,
    stale_results_discarded: AtomicU64,
    transient_fetch_failures: AtomicU64,
    resyncs_triggered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCountersSnapshot {
    pub events_dropped_while_hidden: u64,
    pub protocol_violations: u64,
    pub stale_results_discarded: u64,
    pub transient_fetch_failures: u64,
    pub resyncs_triggered: u64,
}

impl SyncCounters {
    pub fn snapshot(&self) -> SyncCountersSnapshot {
        SyncCountersSnapshot {
            events_dropped_while_hidden: self.events_dropped_while_hidden.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            stale_results_discarded: self.stale_results_discarded.load(Ordering::Relaxed),
            transient_fetch_failures: self.transient_fetch_failures.load(Ordering::Relaxed),
            resyncs_triggered: self.resyncs_triggered.load(Ordering::Relaxed),
        }
    }

    pub fn record_event_dropped_while_hidden(&self) {
        self.events_dropped_while_hidden
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_result(&self) {
        self.stale_results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.transient_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs_triggered.fetch_add(1, Ordering::Relaxed);
    }
}
