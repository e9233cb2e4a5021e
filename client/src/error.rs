/// Classification of every asynchronous outcome in the sync core. Nothing
/// escapes the event-processing boundary without first becoming one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A load whose `cancel()` fired before resolution. Expected, never
    /// surfaced to users.
    #[error("load canceled")]
    Canceled,
    /// A result that resolved under a superseded generation. Discarded
    /// silently; not an error condition.
    #[error("result from a superseded generation")]
    StaleResult,
    /// A boundary fetch failed while its generation was still current. Retry
    /// policy belongs to a higher layer.
    #[error("transient fetch failure: {0}")]
    TransientFetchFailure(String),
    /// The boundary rejected the bearer credential. The host handles
    /// re-authentication; this core only reports the classification.
    #[error("authentication required")]
    AuthRequired,
    /// An inbound event referenced an unknown map id or carried a malformed
    /// payload. Dropped with a diagnostic; the engine keeps running.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
