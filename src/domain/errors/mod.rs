//! Domain error types.

mod load_error;
mod storage_error;
mod transport_error;

pub use load_error::LoadError;
pub use storage_error::{StorageError, StorageResult};
pub use transport_error::{TransportError, TransportErrorKind};
