//! Durable log backends.

use std::sync::Arc;

use weft_core::config::{DurabilityBackend, DurabilityConfig};
use weft_core::error::Result;
use weft_core::traits::DurableLog;

mod memory;
mod sqlite;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;

/// Open the backend selected by the configuration.
pub fn open_log(config: &DurabilityConfig) -> Result<Arc<dyn DurableLog>> {
    match config.backend {
        DurabilityBackend::Sqlite => Ok(Arc::new(SqliteLog::open(&config.db_path())?)),
        DurabilityBackend::Memory => Ok(Arc::new(MemoryLog::new())),
    }
}
