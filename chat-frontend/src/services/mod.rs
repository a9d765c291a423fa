pub mod metrics;
pub mod sessions;

pub use sessions::{SessionHandle, SessionRegistry};
