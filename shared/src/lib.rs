pub mod events;
pub mod map;
pub mod reconcile;

pub use events::*;
pub use map::*;
pub use reconcile::apply_token_op;
