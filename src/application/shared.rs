//! Optional process-wide default manager.
//!
//! Nothing inside the crate reads this; callers that want a single global
//! manager install one at startup and fetch it where passing a handle is
//! inconvenient.

use std::sync::{Arc, OnceLock};

use super::load_manager::LoadManager;

static SHARED: OnceLock<Arc<LoadManager>> = OnceLock::new();

/// Installs the process-wide manager. Returns the manager back if one was
/// already installed.
///
/// # Errors
/// Returns `manager` unchanged when a default is already set.
pub fn install(manager: Arc<LoadManager>) -> Result<(), Arc<LoadManager>> {
    SHARED.set(manager)
}

/// The installed manager, if any.
#[must_use]
pub fn shared() -> Option<Arc<LoadManager>> {
    SHARED.get().cloned()
}
