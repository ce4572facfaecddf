//! Store construction from pipeline configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tidewater_state::backend::BufferLimits;
use tidewater_state::{BufferStore, SqliteBufferStore, SqliteStateBackend, StateBackend};

use crate::config::types::{
    parse_byte_size, BufferConfig, PipelineConfig, StateBackendKind, WarehouseBackendKind,
};
use crate::warehouse::{SqliteWarehouse, Warehouse};

fn default_state_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tidewater").join("state.db")
}

pub(crate) fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    let backend = match config.state.backend {
        StateBackendKind::Memory => {
            SqliteStateBackend::in_memory().context("Failed to open in-memory state DB")?
        }
        StateBackendKind::Sqlite => {
            if let Some(path) = &config.state.path {
                SqliteStateBackend::open(path).context("Failed to open state DB")?
            } else {
                SqliteStateBackend::open(&default_state_path())
                    .context("Failed to open default state DB")?
            }
        }
    };
    Ok(Arc::new(backend) as Arc<dyn StateBackend>)
}

pub(crate) fn create_warehouse(config: &PipelineConfig) -> Result<Arc<dyn Warehouse>> {
    let columns = config.warehouse.columns.clone();
    let warehouse = match (config.warehouse.backend, &config.warehouse.path) {
        (WarehouseBackendKind::Sqlite, Some(path)) => SqliteWarehouse::open(path, columns)
            .with_context(|| format!("Failed to open warehouse at {}", path.display()))?,
        (WarehouseBackendKind::Sqlite, None) => {
            anyhow::bail!("warehouse.path is required for the sqlite backend")
        }
        (WarehouseBackendKind::Memory, _) => {
            SqliteWarehouse::in_memory(columns).context("Failed to open in-memory warehouse")?
        }
    };
    Ok(Arc::new(warehouse) as Arc<dyn Warehouse>)
}

pub(crate) fn buffer_limits(config: &BufferConfig) -> Result<BufferLimits> {
    let max_bytes = parse_byte_size(&config.max_bytes)
        .map_err(|e| anyhow::anyhow!("buffer.max_bytes: {e}"))?;
    Ok(BufferLimits {
        max_records: config.max_records,
        max_bytes,
    })
}

pub(crate) fn create_buffer_store(config: &BufferConfig) -> Result<Arc<dyn BufferStore>> {
    let limits = buffer_limits(config)?;
    let store = match &config.path {
        Some(path) => SqliteBufferStore::open(path, limits, config.lanes).with_context(|| {
            format!("Failed to open ingestion buffer at {}", path.display())
        })?,
        None => {
            tracing::warn!("No buffer.path configured, buffering in memory (not durable)");
            SqliteBufferStore::in_memory(limits, config.lanes)
                .context("Failed to open in-memory buffer")?
        }
    };
    Ok(Arc::new(store) as Arc<dyn BufferStore>)
}
