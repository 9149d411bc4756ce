//! Kernel module ensurer

use tracing::{debug, error, info};
use tunkeep_common::{KeeperError, KeeperResult};

use crate::netstate::NetworkState;

/// Loads every module in `modules` that is not already loaded.
///
/// Returns the modules that had to be loaded. A failed load is
/// [`KeeperError::ModuleLoad`], which the keeper treats as fatal.
pub async fn ensure_modules(
    net: &dyn NetworkState,
    modules: &[String],
) -> KeeperResult<Vec<String>> {
    let mut loaded = Vec::new();

    for module in modules {
        let present = match net.is_module_loaded(module).await {
            Ok(present) => present,
            Err(e) => {
                // modprobe is a no-op for loaded modules, so just ask for it.
                debug!(module = %module, error = %e, "Module registry unreadable");
                false
            }
        };
        if present {
            continue;
        }

        info!(module = %module, "Loading kernel module");
        if let Err(e) = net.load_module(module).await {
            error!(module = %module, error = %e, "Kernel module could not be loaded");
            return Err(KeeperError::module_load(module.as_str(), e.to_string()));
        }
        loaded.push(module.clone());
    }

    Ok(loaded)
}
