/// Small shared helpers
pub mod backoff;

pub use backoff::Backoff;
