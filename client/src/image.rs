use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::SyncError;

/// A decoded RGBA image ready for the renderer.
#[derive(Debug, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

/// Cancellation token for one in-flight load. Owned by the engine, one per
/// issued load, never shared between generations.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    canceled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl CancelHandle {
    /// Best-effort, synchronous, idempotent. Called after resolution it is a
    /// no-op.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// One cancelable fetch+decode of a single image resource.
pub struct ImageLoadTask {
    rx: oneshot::Receiver<Result<Arc<DecodedImage>, SyncError>>,
    handle: CancelHandle,
}

impl ImageLoadTask {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Resolves exactly once. A canceled load resolves as `Canceled` — never
    /// as success and never as a fetch failure.
    pub async fn result(self) -> Result<Arc<DecodedImage>, SyncError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Canceled),
        }
    }

    /// Test seam: a task whose resolution the caller controls.
    #[cfg(test)]
    pub(crate) fn stub() -> (
        Self,
        oneshot::Sender<Result<Arc<DecodedImage>, SyncError>>,
        CancelHandle,
    ) {
        let (tx, rx) = oneshot::channel();
        let handle = CancelHandle {
            canceled: Arc::new(AtomicBool::new(false)),
            abort: None,
        };
        (
            Self {
                rx,
                handle: handle.clone(),
            },
            tx,
            handle,
        )
    }
}

/// Start loading one image. The fetch runs on the runtime, the decode on the
/// blocking pool; the result is delivered at most once and only if `cancel()`
/// has not fired first.
pub fn load(http: reqwest::Client, url: String) -> ImageLoadTask {
    let canceled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&canceled);
    let (tx, rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let result = fetch_and_decode(&http, &url).await;
        if flag.load(Ordering::Acquire) {
            debug!(%url, "image load canceled before delivery");
            return;
        }
        let _ = tx.send(result.map(Arc::new));
    });

    ImageLoadTask {
        rx,
        handle: CancelHandle {
            canceled,
            abort: Some(join.abort_handle()),
        },
    }
}

async fn fetch_and_decode(http: &reqwest::Client, url: &str) -> Result<DecodedImage, SyncError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| SyncError::TransientFetchFailure(format!("request failed: {e}")))?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::AuthRequired);
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| SyncError::TransientFetchFailure(format!("failed to read image body: {e}")))?;
    if !status.is_success() {
        return Err(SyncError::TransientFetchFailure(format!(
            "image fetch returned status {status}"
        )));
    }

    tokio::task::spawn_blocking(move || decode(&bytes))
        .await
        .map_err(|e| SyncError::TransientFetchFailure(format!("decode task failed: {e}")))?
}

fn decode(bytes: &[u8]) -> Result<DecodedImage, SyncError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| SyncError::TransientFetchFailure(format!("image decode failed: {e}")))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: Bytes::from(rgba.into_raw()),
    })
}
