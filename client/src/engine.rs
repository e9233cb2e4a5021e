use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use lantern_shared::{
    MapEntity, MapEvent, MarkedArea, OutboundEvent, TokenOp, TokenPatch, apply_token_op,
};

use crate::api::MapApi;
use crate::config;
use crate::debounce::{TokenWriteDebouncer, WriteFn};
use crate::error::SyncError;
use crate::image::{self, CancelHandle, DecodedImage, ImageLoadTask};
use crate::marks;
use crate::state::{MapState, SnapshotChange, SyncCounters, SyncCountersSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadKind {
    Base,
    Fog,
}

type LoadFn = Arc<dyn Fn(LoadKind, &str) -> Result<ImageLoadTask, String> + Send + Sync>;
type FetchActiveMapFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<MapEntity>, SyncError>> + Send + Sync>;

/// Seams for everything the engine asks the outside world to do. Production
/// wiring binds them to `MapApi`; tests inject recorders.
pub(crate) struct EngineDeps {
    pub load_image: LoadFn,
    pub fetch_active_map: FetchActiveMapFn,
    pub write_token: WriteFn,
    pub quiet_window: Duration,
}

enum Command {
    Event(MapEvent),
    SetVisible(bool),
    Resync,
    MarkAreaLocal { x: f64, y: f64 },
    RemoveMarkedArea { id: String },
    UpdateTokenLocal { patch: TokenPatch },
}

enum Internal {
    Load {
        generation: u64,
        kind: LoadKind,
        result: Result<Arc<DecodedImage>, SyncError>,
    },
    Resync(Result<Option<MapEntity>, SyncError>),
}

/// Per-generation session state. The exposed snapshot flips only on the
/// transitions described in the session state machine: it keeps showing the
/// previous ready map while a new session is still loading, then map, base
/// and fog are published together.
enum Session {
    Empty,
    /// First entry into a map: both images must resolve under the current
    /// generation before anything is published.
    LoadingBoth {
        map: Box<MapEntity>,
        base: Option<Arc<DecodedImage>>,
        fog: Option<Arc<DecodedImage>>,
        base_cancel: CancelHandle,
        fog_cancel: CancelHandle,
    },
    /// Map is published; `fog_reload` tracks an in-flight fog-only refresh.
    Ready {
        map_id: String,
        fog_reload: Option<CancelHandle>,
    },
}

/// Handle to the sync engine. Cheap to clone; all state mutation happens on
/// the single engine task behind it.
#[derive(Clone)]
pub struct MapSync {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<MapState>>,
    changes: broadcast::Sender<SnapshotChange>,
    outbound: broadcast::Sender<OutboundEvent>,
    counters: Arc<SyncCounters>,
}

impl MapSync {
    /// Wire the engine against the HTTP boundary and spawn it. Call
    /// `resync()` afterwards to fetch the initially active map.
    pub fn spawn(api: MapApi) -> Self {
        let image_api = api.clone();
        let load_image: LoadFn = Arc::new(move |kind, map_id: &str| {
            let url = match kind {
                LoadKind::Base => image_api.map_image_url(map_id)?,
                LoadKind::Fog => image_api.fog_image_url(map_id)?,
            };
            Ok(image::load(image_api.http().clone(), url))
        });

        let fetch_api = api.clone();
        let fetch_active_map: FetchActiveMapFn = Arc::new(move || {
            let api = fetch_api.clone();
            Box::pin(async move { api.fetch_active_map().await })
        });

        let write_token: WriteFn = Arc::new(move |map_id, token_id, fields| {
            let api = api.clone();
            Box::pin(async move { api.patch_token(&map_id, &token_id, &fields).await })
        });

        Self::spawn_with(EngineDeps {
            load_image,
            fetch_active_map,
            write_token,
            quiet_window: config::quiet_window(),
        })
    }

    pub(crate) fn spawn_with(deps: EngineDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(config::change_buffer());
        let (outbound, _) = broadcast::channel(config::outbound_buffer());
        let snapshot = Arc::new(RwLock::new(MapState::default()));
        let counters = Arc::new(SyncCounters::default());
        let debounce = TokenWriteDebouncer::spawn(deps.quiet_window, Arc::clone(&deps.write_token));

        let engine = Engine {
            deps,
            snapshot: Arc::clone(&snapshot),
            changes: changes.clone(),
            outbound: outbound.clone(),
            counters: Arc::clone(&counters),
            debounce,
            internal_tx,
            generation: 0,
            visible: true,
            resync_in_flight: false,
            session: Session::Empty,
        };
        tokio::spawn(engine.run(rx, internal_rx));

        Self {
            tx,
            snapshot,
            changes,
            outbound,
            counters,
        }
    }

    /// Feed one inbound push-channel event.
    pub fn handle_event(&self, event: MapEvent) {
        let _ = self.tx.send(Command::Event(event));
    }

    /// Convenience for transports that deliver raw named events: parse the
    /// payload and feed it in, classifying malformed input as a protocol
    /// violation without disturbing the engine.
    pub fn handle_push_payload(&self, name: &str, payload: &str) -> Result<(), SyncError> {
        match lantern_shared::parse_push_event(name, payload) {
            Ok(event) => {
                self.handle_event(event);
                Ok(())
            }
            Err(e) => {
                self.counters.record_protocol_violation();
                warn!(event = name, error = %e, "dropping malformed push event");
                Err(SyncError::ProtocolViolation(e))
            }
        }
    }

    /// Request one full resynchronization: fetch the active map and feed it
    /// through the full-replace path. Used at startup and by visibility
    /// recovery; concurrent requests collapse into one fetch.
    pub fn resync(&self) {
        let _ = self.tx.send(Command::Resync);
    }

    /// Tell the engine whether the host is visible. While hidden, inbound
    /// events other than a null full-replace are dropped; the hidden→visible
    /// transition triggers exactly one resync.
    pub fn set_visible(&self, visible: bool) {
        let _ = self.tx.send(Command::SetVisible(visible));
    }

    /// Local mark action: appends under a locally generated id and emits the
    /// mark onto the push channel.
    pub fn mark_area(&self, x: f64, y: f64) {
        let _ = self.tx.send(Command::MarkAreaLocal { x, y });
    }

    /// Called by the renderer once a marker's visual lifetime has elapsed.
    pub fn remove_marked_area(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::RemoveMarkedArea { id: id.into() });
    }

    /// Optimistic local token edit: applied to the snapshot immediately and
    /// persisted through the debouncer.
    pub fn update_token_local(&self, patch: TokenPatch) {
        let _ = self.tx.send(Command::UpdateTokenLocal { patch });
    }

    pub async fn snapshot(&self) -> MapState {
        self.snapshot.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotChange> {
        self.changes.subscribe()
    }

    pub fn change_stream(&self) -> BroadcastStream<SnapshotChange> {
        BroadcastStream::new(self.subscribe())
    }

    /// Outbound push-channel events for the transport to drain.
    pub fn outbound_events(&self) -> broadcast::Receiver<OutboundEvent> {
        self.outbound.subscribe()
    }

    pub fn counters(&self) -> SyncCountersSnapshot {
        self.counters.snapshot()
    }
}

struct Engine {
    deps: EngineDeps,
    snapshot: Arc<RwLock<MapState>>,
    changes: broadcast::Sender<SnapshotChange>,
    outbound: broadcast::Sender<OutboundEvent>,
    counters: Arc<SyncCounters>,
    debounce: TokenWriteDebouncer,
    internal_tx: mpsc::UnboundedSender<Internal>,
    generation: u64,
    visible: bool,
    resync_in_flight: bool,
    session: Session,
}

impl Engine {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("map sync engine started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        self.cancel_session_loads();
        info!("map sync engine stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Event(event) => self.handle_event(event).await,
            Command::SetVisible(visible) => self.set_visible(visible),
            Command::Resync => self.trigger_resync(),
            Command::MarkAreaLocal { x, y } => self.mark_area_local(x, y).await,
            Command::RemoveMarkedArea { id } => self.remove_marked_area(&id).await,
            Command::UpdateTokenLocal { patch } => self.update_token_local(patch).await,
        }
    }

    async fn handle_event(&mut self, event: MapEvent) {
        if !self.visible && !matches!(event, MapEvent::MapUpdate { map: None }) {
            self.counters.record_event_dropped_while_hidden();
            debug!("dropping push event while hidden");
            return;
        }
        match event {
            MapEvent::MapUpdate { map: None } => self.clear_map().await,
            MapEvent::MapUpdate { map: Some(map) } => self.replace_map(map).await,
            MapEvent::FogUpdate { map_id } => self.reload_fog(&map_id),
            MapEvent::TokenOp { map_id, op } => self.apply_remote_token_op(&map_id, op).await,
            MapEvent::MarkArea { id, x, y } => {
                self.append_marked_area(MarkedArea { id, x, y }).await;
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Load {
                generation,
                kind,
                result,
            } => self.apply_load_result(generation, kind, result).await,
            Internal::Resync(result) => {
                self.resync_in_flight = false;
                match result {
                    Ok(map) => self.handle_event(MapEvent::MapUpdate { map }).await,
                    Err(SyncError::AuthRequired) => {
                        warn!("resync rejected: authentication required");
                        let _ = self.changes.send(SnapshotChange::AuthRequired);
                    }
                    Err(e) => {
                        self.counters.record_transient_failure();
                        warn!(error = %e, "full resync failed");
                    }
                }
            }
        }
    }

    fn current_map_id(&self) -> Option<&str> {
        match &self.session {
            Session::Empty => None,
            Session::LoadingBoth { map, .. } => Some(map.id.as_str()),
            Session::Ready { map_id, .. } => Some(map_id.as_str()),
        }
    }

    async fn clear_map(&mut self) {
        self.cancel_session_loads();
        // Strand anything still in flight for the prior map.
        self.generation += 1;
        self.session = Session::Empty;
        {
            let mut snap = self.snapshot.write().await;
            snap.map = None;
            snap.base_image = None;
            snap.fog_image = None;
        }
        info!("active map cleared");
        let _ = self.changes.send(SnapshotChange::MapCleared);
    }

    async fn replace_map(&mut self, map: MapEntity) {
        if self.current_map_id() == Some(map.id.as_str()) {
            self.refresh_current_map(map).await;
            return;
        }

        self.cancel_session_loads();
        self.generation += 1;
        let generation = self.generation;
        info!(map_id = %map.id, generation, "entering new map session");

        let base_cancel = self.start_load(LoadKind::Base, &map.id, generation);
        let fog_cancel = self.start_load(LoadKind::Fog, &map.id, generation);
        match (base_cancel, fog_cancel) {
            (Some(base_cancel), Some(fog_cancel)) => {
                self.session = Session::LoadingBoth {
                    map: Box::new(map),
                    base: None,
                    fog: None,
                    base_cancel,
                    fog_cancel,
                };
            }
            (base_cancel, fog_cancel) => {
                if let Some(cancel) = base_cancel {
                    cancel.cancel();
                }
                if let Some(cancel) = fog_cancel {
                    cancel.cancel();
                }
                self.session = Session::Empty;
            }
        }
    }

    /// Same-id full replace: the server state is authoritative, so the token
    /// collection and grid are refreshed (this is what lets a resync
    /// supersede drift) and the fog overlay is re-fetched. The base image is
    /// static per session and stays untouched.
    async fn refresh_current_map(&mut self, map: MapEntity) {
        let map_id = map.id.clone();
        match &mut self.session {
            Session::Empty => return,
            Session::LoadingBoth {
                map: pending,
                fog,
                fog_cancel,
                ..
            } => {
                **pending = map;
                // A fresher fog overlay exists; the one in flight is stale.
                fog_cancel.cancel();
                *fog = None;
                let generation = self.generation;
                if let Some(cancel) = self.start_load(LoadKind::Fog, &map_id, generation) {
                    if let Session::LoadingBoth { fog_cancel, .. } = &mut self.session {
                        *fog_cancel = cancel;
                    }
                }
                return;
            }
            Session::Ready { .. } => {
                {
                    let mut snap = self.snapshot.write().await;
                    snap.map = Some(map);
                }
                let _ = self.changes.send(SnapshotChange::TokensChanged);
            }
        }
        self.reload_fog(&map_id);
    }

    fn reload_fog(&mut self, map_id: &str) {
        match &self.session {
            Session::Ready { map_id: current, .. } if current == map_id => {}
            Session::LoadingBoth { map, .. } if map.id == map_id => {
                // Initial fog load is still in flight; it was issued with a
                // fresh cache-buster and will deliver the current overlay.
                return;
            }
            _ => {
                self.counters.record_protocol_violation();
                warn!(%map_id, "fog update for a map that is not current; dropping");
                return;
            }
        }

        if let Session::Ready { fog_reload, .. } = &mut self.session {
            // A newer overlay supersedes any reload still in flight.
            if let Some(previous) = fog_reload.take() {
                previous.cancel();
            }
        }
        let generation = self.generation;
        let cancel = self.start_load(LoadKind::Fog, map_id, generation);
        if let Session::Ready { fog_reload, .. } = &mut self.session {
            *fog_reload = cancel;
        }
    }

    fn start_load(&self, kind: LoadKind, map_id: &str, generation: u64) -> Option<CancelHandle> {
        let task = match (self.deps.load_image)(kind, map_id) {
            Ok(task) => task,
            Err(e) => {
                self.counters.record_protocol_violation();
                warn!(%map_id, error = %e, "failed to start image load");
                return None;
            }
        };
        let handle = task.cancel_handle();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = task.result().await;
            let _ = internal_tx.send(Internal::Load {
                generation,
                kind,
                result,
            });
        });
        Some(handle)
    }

    async fn apply_load_result(
        &mut self,
        generation: u64,
        kind: LoadKind,
        result: Result<Arc<DecodedImage>, SyncError>,
    ) {
        if generation != self.generation {
            self.counters.record_stale_result();
            debug!(
                generation,
                current = self.generation,
                "discarding image result from a superseded generation"
            );
            return;
        }

        let image = match result {
            Ok(image) => image,
            // Expected: a newer load for the same session replaced this one.
            Err(SyncError::Canceled) => return,
            Err(SyncError::AuthRequired) => {
                warn!("image fetch rejected: authentication required");
                let _ = self.changes.send(SnapshotChange::AuthRequired);
                return;
            }
            Err(e) => {
                self.counters.record_transient_failure();
                warn!(error = %e, "image load failed on the current generation");
                return;
            }
        };

        match (&mut self.session, kind) {
            (Session::Empty, _) => {
                debug!("image resolved with no active session");
                return;
            }
            (Session::LoadingBoth { base, .. }, LoadKind::Base) => {
                *base = Some(image);
            }
            (Session::LoadingBoth { fog, .. }, LoadKind::Fog) => {
                *fog = Some(image);
            }
            (Session::Ready { fog_reload, .. }, LoadKind::Fog) => {
                *fog_reload = None;
                {
                    let mut snap = self.snapshot.write().await;
                    snap.fog_image = Some(image);
                }
                let _ = self.changes.send(SnapshotChange::FogUpdated);
                return;
            }
            (Session::Ready { .. }, LoadKind::Base) => {
                debug!("base image result while ready; dropping");
                return;
            }
        }

        // First entry into the session: publish map, base and fog together so
        // no frame ever shows one without the other.
        if let Session::LoadingBoth {
            base: Some(_),
            fog: Some(_),
            ..
        } = &self.session
        {
            let previous = std::mem::replace(&mut self.session, Session::Empty);
            let Session::LoadingBoth {
                map,
                base: Some(base),
                fog: Some(fog),
                ..
            } = previous
            else {
                return;
            };
            let map_id = map.id.clone();
            {
                let mut snap = self.snapshot.write().await;
                snap.map = Some(*map);
                snap.base_image = Some(base);
                snap.fog_image = Some(fog);
            }
            self.session = Session::Ready {
                map_id: map_id.clone(),
                fog_reload: None,
            };
            info!(map_id = %map_id, "map session ready");
            let _ = self.changes.send(SnapshotChange::MapReady);
        }
    }

    async fn apply_remote_token_op(&mut self, map_id: &str, op: TokenOp) {
        if self.current_map_id() != Some(map_id) {
            self.counters.record_protocol_violation();
            warn!(%map_id, "token event for a map that is not current; dropping");
            return;
        }
        match &mut self.session {
            Session::Empty => {}
            Session::LoadingBoth { map, .. } => {
                apply_token_op(&mut map.tokens, op);
            }
            Session::Ready { .. } => {
                {
                    let mut snap = self.snapshot.write().await;
                    if let Some(map) = snap.map.as_mut() {
                        apply_token_op(&mut map.tokens, op);
                    }
                }
                let _ = self.changes.send(SnapshotChange::TokensChanged);
            }
        }
    }

    async fn append_marked_area(&mut self, area: MarkedArea) {
        {
            let mut snap = self.snapshot.write().await;
            marks::append_marked_area(&mut snap.marked_areas, area);
        }
        let _ = self.changes.send(SnapshotChange::MarkedAreasChanged);
    }

    async fn mark_area_local(&mut self, x: f64, y: f64) {
        let area = MarkedArea {
            id: uuid::Uuid::new_v4().to_string(),
            x,
            y,
        };
        self.append_marked_area(area).await;
        let _ = self.outbound.send(OutboundEvent::MarkArea { x, y });
    }

    async fn remove_marked_area(&mut self, id: &str) {
        let removed = {
            let mut snap = self.snapshot.write().await;
            marks::remove_marked_area(&mut snap.marked_areas, id)
        };
        if removed {
            let _ = self.changes.send(SnapshotChange::MarkedAreasChanged);
        }
    }

    async fn update_token_local(&mut self, patch: TokenPatch) {
        let Session::Ready { map_id, .. } = &self.session else {
            debug!("ignoring local token update without a ready map");
            return;
        };
        let map_id = map_id.clone();
        let token_id = patch.id.clone();
        let fields = patch.fields.clone();
        {
            let mut snap = self.snapshot.write().await;
            if let Some(map) = snap.map.as_mut() {
                apply_token_op(&mut map.tokens, TokenOp::Update { token: patch });
            }
        }
        let _ = self.changes.send(SnapshotChange::TokensChanged);
        self.debounce.schedule(map_id, token_id, fields);
    }

    fn set_visible(&mut self, visible: bool) {
        if visible == self.visible {
            return;
        }
        self.visible = visible;
        if visible {
            info!("host became visible; requesting full resync");
            self.trigger_resync();
        }
        // Going hidden mutates nothing; outstanding loads stay bounded by the
        // generation check on completion.
    }

    fn trigger_resync(&mut self) {
        if self.resync_in_flight {
            return;
        }
        self.resync_in_flight = true;
        self.counters.record_resync();
        let fetch = Arc::clone(&self.deps.fetch_active_map);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetch().await;
            let _ = internal_tx.send(Internal::Resync(result));
        });
    }

    fn cancel_session_loads(&mut self) {
        match &mut self.session {
            Session::Empty => {}
            Session::LoadingBoth {
                base_cancel,
                fog_cancel,
                ..
            } => {
                base_cancel.cancel();
                fog_cancel.cancel();
            }
            Session::Ready { fog_reload, .. } => {
                if let Some(cancel) = fog_reload.take() {
                    cancel.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::{Map, Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    use lantern_shared::Token;

    struct StartedLoad {
        kind: LoadKind,
        map_id: String,
        tx: oneshot::Sender<Result<Arc<DecodedImage>, SyncError>>,
        handle: CancelHandle,
    }

    #[derive(Clone)]
    struct Harness {
        loads: Arc<Mutex<VecDeque<StartedLoad>>>,
        resync_calls: Arc<Mutex<u64>>,
        resync_response: Arc<Mutex<Result<Option<MapEntity>, SyncError>>>,
        writes: Arc<Mutex<Vec<(String, String, Map<String, Value>)>>>,
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    impl Harness {
        fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "warn".into()),
                )
                .try_init();
            Self {
                loads: Arc::new(Mutex::new(VecDeque::new())),
                resync_calls: Arc::new(Mutex::new(0)),
                resync_response: Arc::new(Mutex::new(Ok(None))),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn spawn(&self) -> MapSync {
            let loads = Arc::clone(&self.loads);
            let load_image: LoadFn = Arc::new(move |kind, map_id: &str| {
                let (task, tx, handle) = ImageLoadTask::stub();
                lock(&loads).push_back(StartedLoad {
                    kind,
                    map_id: map_id.to_string(),
                    tx,
                    handle,
                });
                Ok(task)
            });

            let calls = Arc::clone(&self.resync_calls);
            let response = Arc::clone(&self.resync_response);
            let fetch_active_map: FetchActiveMapFn = Arc::new(move || {
                *lock(&calls) += 1;
                let response = lock(&response).clone();
                Box::pin(async move { response })
            });

            let writes = Arc::clone(&self.writes);
            let write_token: WriteFn = Arc::new(move |map_id, token_id, fields| {
                lock(&writes).push((map_id, token_id, fields));
                Box::pin(async { Ok::<(), SyncError>(()) })
            });

            MapSync::spawn_with(EngineDeps {
                load_image,
                fetch_active_map,
                write_token,
                quiet_window: Duration::from_millis(100),
            })
        }

        fn take_load(&self) -> StartedLoad {
            lock(&self.loads)
                .pop_front()
                .expect("a load should have been started")
        }

        fn load_count(&self) -> usize {
            lock(&self.loads).len()
        }

        fn resync_count(&self) -> u64 {
            *lock(&self.resync_calls)
        }

        fn set_resync_response(&self, response: Result<Option<MapEntity>, SyncError>) {
            *lock(&self.resync_response) = response;
        }

        fn writes(&self) -> Vec<(String, String, Map<String, Value>)> {
            lock(&self.writes).clone()
        }
    }

    fn test_image() -> Arc<DecodedImage> {
        Arc::new(DecodedImage {
            width: 1,
            height: 1,
            pixels: Bytes::from_static(&[0, 0, 0, 255]),
        })
    }

    fn token(id: &str) -> Token {
        Token {
            id: id.to_string(),
            x: 0.0,
            y: 0.0,
            is_visible_for_players: true,
            extra: Map::new(),
        }
    }

    fn map_entity(id: &str, token_ids: &[&str]) -> MapEntity {
        MapEntity {
            id: id.to_string(),
            title: format!("Map {id}"),
            tokens: token_ids.iter().map(|t| token(t)).collect(),
            grid: None,
            show_grid_to_players: false,
        }
    }

    fn patch(id: &str, fields: Value) -> TokenPatch {
        TokenPatch {
            id: id.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SnapshotChange>) -> Vec<SnapshotChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    async fn settle() {
        for _ in 0..40 {
            tokio::task::yield_now().await;
        }
    }

    async fn make_ready(harness: &Harness, sync: &MapSync, id: &str, token_ids: &[&str]) {
        sync.handle_event(MapEvent::MapUpdate {
            map: Some(map_entity(id, token_ids)),
        });
        settle().await;
        let base = harness.take_load();
        let fog = harness.take_load();
        assert_eq!(base.kind, LoadKind::Base);
        assert_eq!(fog.kind, LoadKind::Fog);
        let _ = base.tx.send(Ok(test_image()));
        let _ = fog.tx.send(Ok(test_image()));
        settle().await;
        assert_eq!(
            sync.snapshot().await.map.as_ref().map(|m| m.id.as_str()),
            Some(id)
        );
    }

    #[tokio::test]
    async fn full_replace_publishes_only_after_both_images_resolve() {
        let harness = Harness::new();
        let sync = harness.spawn();
        let mut changes = sync.subscribe();

        sync.handle_event(MapEvent::MapUpdate {
            map: Some(map_entity("m1", &["t1"])),
        });
        settle().await;
        assert!(sync.snapshot().await.is_empty());
        assert_eq!(harness.load_count(), 2);

        let base = harness.take_load();
        let fog = harness.take_load();
        assert_eq!((base.kind, base.map_id.as_str()), (LoadKind::Base, "m1"));
        assert_eq!((fog.kind, fog.map_id.as_str()), (LoadKind::Fog, "m1"));

        let _ = base.tx.send(Ok(test_image()));
        settle().await;
        assert!(sync.snapshot().await.is_empty());

        let _ = fog.tx.send(Ok(test_image()));
        settle().await;
        let snap = sync.snapshot().await;
        assert_eq!(snap.map.as_ref().map(|m| m.id.as_str()), Some("m1"));
        assert!(snap.base_image.is_some());
        assert!(snap.fog_image.is_some());
        assert!(drain(&mut changes).contains(&SnapshotChange::MapReady));
    }

    #[tokio::test]
    async fn superseded_session_results_never_touch_the_snapshot() {
        let harness = Harness::new();
        let sync = harness.spawn();

        sync.handle_event(MapEvent::MapUpdate {
            map: Some(map_entity("a", &[])),
        });
        settle().await;
        let a_base = harness.take_load();
        let a_fog = harness.take_load();

        sync.handle_event(MapEvent::MapUpdate {
            map: Some(map_entity("b", &[])),
        });
        settle().await;
        assert!(a_base.handle.is_canceled());
        assert!(a_fog.handle.is_canceled());

        let b_base = harness.take_load();
        let b_fog = harness.take_load();
        let _ = b_base.tx.send(Ok(test_image()));
        let _ = b_fog.tx.send(Ok(test_image()));
        settle().await;
        assert_eq!(
            sync.snapshot().await.map.as_ref().map(|m| m.id.as_str()),
            Some("b")
        );

        // Map A's results arrive late; the generation check strands them.
        let _ = a_base.tx.send(Ok(test_image()));
        let _ = a_fog.tx.send(Ok(test_image()));
        settle().await;
        assert_eq!(
            sync.snapshot().await.map.as_ref().map(|m| m.id.as_str()),
            Some("b")
        );
        assert_eq!(sync.counters().stale_results_discarded, 2);
    }

    #[tokio::test]
    async fn null_replace_clears_the_snapshot_and_cancels_pending_fog() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &["t1"]).await;

        sync.handle_event(MapEvent::FogUpdate {
            map_id: "m1".to_string(),
        });
        settle().await;
        let reload = harness.take_load();
        assert_eq!(reload.kind, LoadKind::Fog);

        sync.handle_event(MapEvent::MapUpdate { map: None });
        settle().await;
        assert!(reload.handle.is_canceled());
        let snap = sync.snapshot().await;
        assert!(snap.is_empty());
        assert!(snap.base_image.is_none());
        assert!(snap.fog_image.is_none());

        // Even if the canceled load still resolves, nothing changes.
        let _ = reload.tx.send(Ok(test_image()));
        settle().await;
        assert!(sync.snapshot().await.is_empty());
        assert_eq!(sync.counters().stale_results_discarded, 1);
    }

    #[tokio::test]
    async fn fog_update_swaps_only_the_fog_image() {
        let harness = Harness::new();
        let sync = harness.spawn();
        let mut changes = sync.subscribe();
        make_ready(&harness, &sync, "m1", &["t1"]).await;
        let before = sync.snapshot().await;
        let base_before = before.base_image.expect("base should be loaded");
        let fog_before = before.fog_image.expect("fog should be loaded");
        drain(&mut changes);

        sync.handle_event(MapEvent::FogUpdate {
            map_id: "m1".to_string(),
        });
        settle().await;
        let mid = sync.snapshot().await;
        assert!(Arc::ptr_eq(
            mid.fog_image.as_ref().expect("fog should remain"),
            &fog_before
        ));

        let reload = harness.take_load();
        let fresh = test_image();
        let _ = reload.tx.send(Ok(Arc::clone(&fresh)));
        settle().await;

        let after = sync.snapshot().await;
        assert!(Arc::ptr_eq(
            after.base_image.as_ref().expect("base should remain"),
            &base_before
        ));
        assert!(Arc::ptr_eq(
            after.fog_image.as_ref().expect("fog should be swapped"),
            &fresh
        ));
        assert_eq!(drain(&mut changes), vec![SnapshotChange::FogUpdated]);
    }

    #[tokio::test]
    async fn fog_update_for_a_foreign_map_is_a_protocol_violation() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &[]).await;

        sync.handle_event(MapEvent::FogUpdate {
            map_id: "m2".to_string(),
        });
        settle().await;
        assert_eq!(harness.load_count(), 0);
        assert_eq!(sync.counters().protocol_violations, 1);
    }

    #[tokio::test]
    async fn token_ops_fold_into_the_current_map_and_foreign_ids_are_dropped() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &["t1"]).await;

        sync.handle_event(MapEvent::TokenOp {
            map_id: "m1".to_string(),
            op: TokenOp::Add { token: token("t2") },
        });
        sync.handle_event(MapEvent::TokenOp {
            map_id: "m1".to_string(),
            op: TokenOp::Update {
                token: patch("t1", json!({"x": 5.0})),
            },
        });
        sync.handle_event(MapEvent::TokenOp {
            map_id: "m1".to_string(),
            op: TokenOp::Remove {
                token_id: "ghost".to_string(),
            },
        });
        settle().await;

        let snap = sync.snapshot().await;
        let map = snap.map.expect("map should be ready");
        let ids: Vec<&str> = map.tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t1", "t2"]);
        assert_eq!(map.tokens[0].x, 5.0);

        sync.handle_event(MapEvent::TokenOp {
            map_id: "m9".to_string(),
            op: TokenOp::Add { token: token("t3") },
        });
        settle().await;
        assert_eq!(sync.counters().protocol_violations, 1);
        let snap = sync.snapshot().await;
        assert_eq!(snap.map.expect("map should remain").tokens.len(), 2);
    }

    #[tokio::test]
    async fn hidden_drops_events_and_recovery_is_exactly_one_resync() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &["t1"]).await;

        sync.set_visible(false);
        settle().await;
        for i in 0..5 {
            sync.handle_event(MapEvent::MarkArea {
                id: format!("a{i}"),
                x: 0.0,
                y: 0.0,
            });
        }
        sync.handle_event(MapEvent::TokenOp {
            map_id: "m1".to_string(),
            op: TokenOp::Add { token: token("t9") },
        });
        sync.handle_event(MapEvent::FogUpdate {
            map_id: "m1".to_string(),
        });
        settle().await;

        let snap = sync.snapshot().await;
        assert!(snap.marked_areas.is_empty());
        assert_eq!(snap.map.as_ref().expect("map should remain").tokens.len(), 1);
        assert_eq!(sync.counters().events_dropped_while_hidden, 7);
        assert_eq!(harness.resync_count(), 0);

        harness.set_resync_response(Ok(Some(map_entity("m1", &["t1", "t2"]))));
        sync.set_visible(true);
        settle().await;
        assert_eq!(harness.resync_count(), 1);

        // Same-id refresh supersedes drift and re-fetches only the fog.
        let snap = sync.snapshot().await;
        assert_eq!(snap.map.as_ref().expect("map should remain").tokens.len(), 2);
        assert_eq!(harness.load_count(), 1);
        let reload = harness.take_load();
        assert_eq!(reload.kind, LoadKind::Fog);

        sync.set_visible(true);
        settle().await;
        assert_eq!(harness.resync_count(), 1);
    }

    #[tokio::test]
    async fn null_replace_is_honored_even_while_hidden() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &[]).await;

        sync.set_visible(false);
        settle().await;
        sync.handle_event(MapEvent::MapUpdate { map: None });
        settle().await;
        assert!(sync.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_token_edits_are_optimistic_and_coalesced() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &["t1"]).await;

        for i in 0..20 {
            sync.update_token_local(patch("t1", json!({"x": i as f64, "y": i as f64})));
        }
        settle().await;

        let snap = sync.snapshot().await;
        let moved = &snap.map.expect("map should be ready").tokens[0];
        assert_eq!((moved.x, moved.y), (19.0, 19.0));
        assert!(harness.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        let writes = harness.writes();
        assert_eq!(writes.len(), 1);
        let (map_id, token_id, fields) = &writes[0];
        assert_eq!((map_id.as_str(), token_id.as_str()), ("m1", "t1"));
        assert_eq!(fields["x"], json!(19.0));
        assert_eq!(fields["y"], json!(19.0));
    }

    #[tokio::test]
    async fn marks_append_from_events_and_local_actions_and_emit_outbound() {
        let harness = Harness::new();
        let sync = harness.spawn();
        let mut outbound = sync.outbound_events();
        make_ready(&harness, &sync, "m1", &[]).await;

        sync.handle_event(MapEvent::MarkArea {
            id: "srv1".to_string(),
            x: 1.0,
            y: 2.0,
        });
        sync.mark_area(3.0, 4.0);
        settle().await;

        let snap = sync.snapshot().await;
        assert_eq!(snap.marked_areas.len(), 2);
        assert_eq!(snap.marked_areas[0].id, "srv1");
        let local_id = snap.marked_areas[1].id.clone();
        assert!(!local_id.is_empty());
        match outbound.try_recv() {
            Ok(OutboundEvent::MarkArea { x, y }) => assert_eq!((x, y), (3.0, 4.0)),
            other => panic!("expected an outbound mark area, got {other:?}"),
        }

        sync.remove_marked_area(local_id);
        sync.remove_marked_area("ghost");
        settle().await;
        let snap = sync.snapshot().await;
        assert_eq!(snap.marked_areas.len(), 1);
        assert_eq!(snap.marked_areas[0].id, "srv1");
    }

    #[tokio::test]
    async fn raw_push_payloads_are_parsed_and_malformed_ones_classified() {
        let harness = Harness::new();
        let sync = harness.spawn();
        make_ready(&harness, &sync, "m1", &["t1"]).await;

        sync.handle_push_payload(
            "token:m1",
            r#"{"type": "remove", "data": {"tokenId": "t1"}}"#,
        )
        .expect("well-formed payload should be accepted");
        settle().await;
        let snap = sync.snapshot().await;
        assert!(snap.map.expect("map should remain").tokens.is_empty());

        let err = sync
            .handle_push_payload("token:m1", "not json")
            .expect_err("malformed payload should be rejected");
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
        assert_eq!(sync.counters().protocol_violations, 1);
    }

    #[tokio::test]
    async fn resync_auth_failure_is_surfaced_as_a_notification() {
        let harness = Harness::new();
        let sync = harness.spawn();
        let mut changes = sync.subscribe();
        harness.set_resync_response(Err(SyncError::AuthRequired));

        sync.resync();
        settle().await;
        assert!(drain(&mut changes).contains(&SnapshotChange::AuthRequired));
        assert!(sync.snapshot().await.is_empty());
    }
}
