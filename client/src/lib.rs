pub mod api;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod image;
mod marks;
pub mod state;

pub use api::MapApi;
pub use debounce::TokenWriteDebouncer;
pub use engine::MapSync;
pub use error::SyncError;
pub use image::{DecodedImage, ImageLoadTask};
pub use state::{MapState, SnapshotChange, SyncCountersSnapshot};
