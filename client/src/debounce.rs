use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::error::SyncError;

/// Outbound write executor: `(map_id, token_id, fields)` → boundary PATCH.
pub type WriteFn = Arc<
    dyn Fn(String, String, Map<String, Value>) -> BoxFuture<'static, Result<(), SyncError>>
        + Send
        + Sync,
>;

type ScheduleMsg = (String, String, Map<String, Value>);

struct Pending {
    deadline: Instant,
    fields: Map<String, Value>,
}

/// Coalesces outgoing token-field writes per `(map_id, token_id)` key. One
/// task and one timer: keys map to a deadline and their pending field union,
/// and entries fire in true temporal order once their quiet window elapses.
/// Independent keys never block each other.
#[derive(Clone)]
pub struct TokenWriteDebouncer {
    tx: mpsc::UnboundedSender<ScheduleMsg>,
}

impl TokenWriteDebouncer {
    pub fn spawn(quiet_window: Duration, write: WriteFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(quiet_window, rx, write));
        Self { tx }
    }

    /// Coalesce a partial token write. Later calls win on overlapping fields;
    /// each call restarts the key's quiet window.
    pub fn schedule(
        &self,
        map_id: impl Into<String>,
        token_id: impl Into<String>,
        fields: Map<String, Value>,
    ) {
        let _ = self.tx.send((map_id.into(), token_id.into(), fields));
    }
}

async fn run(quiet_window: Duration, mut rx: mpsc::UnboundedReceiver<ScheduleMsg>, write: WriteFn) {
    let mut pending: HashMap<(String, String), Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some((map_id, token_id, fields)) => {
                    let deadline = Instant::now() + quiet_window;
                    let entry = pending
                        .entry((map_id, token_id))
                        .or_insert_with(|| Pending { deadline, fields: Map::new() });
                    entry.deadline = deadline;
                    for (key, value) in fields {
                        entry.fields.insert(key, value);
                    }
                }
                None => break,
            },
            () = sleep_until_next(next_deadline) => {
                flush_due(&mut pending, &write);
            }
        }
    }

    // Callers are gone; flush whatever is still pending rather than drop it.
    for ((map_id, token_id), entry) in pending.drain() {
        dispatch_write(&write, map_id, token_id, entry.fields);
    }
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn flush_due(pending: &mut HashMap<(String, String), Pending>, write: &WriteFn) {
    let now = Instant::now();
    let mut due: Vec<((String, String), Instant)> = pending
        .iter()
        .filter(|(_, entry)| entry.deadline <= now)
        .map(|(key, entry)| (key.clone(), entry.deadline))
        .collect();
    due.sort_by_key(|(_, deadline)| *deadline);

    for (key, _) in due {
        if let Some(entry) = pending.remove(&key) {
            dispatch_write(write, key.0, key.1, entry.fields);
        }
    }
}

fn dispatch_write(write: &WriteFn, map_id: String, token_id: String, fields: Map<String, Value>) {
    let fut = write(map_id.clone(), token_id.clone(), fields);
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            // Fire-and-forget: the optimistic local state stays authoritative
            // for the UI, so a lost write is only worth a diagnostic.
            warn!(%map_id, %token_id, error = %e, "token write failed");
        }
    });
}
