pub mod backoff;
pub mod registry;

pub use backoff::backoff_delay;
pub use registry::{ListenerId, Registry};
