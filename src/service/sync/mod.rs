pub mod connections;
mod sliding_sync;

pub use sliding_sync::{SlidingSyncRequest, SlidingSyncResponse, SlidingSyncService};
