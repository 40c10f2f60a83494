mod session;
mod sync_sliding;

pub use session::*;
pub use sync_sliding::*;
