mod backend;
mod tether;

pub use backend::BackendError;
pub use tether::{ErrorCategory, TetherError};
