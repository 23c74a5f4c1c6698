use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::compactor;
use crate::config::{Config, DEFAULT_COMPACT_INTERVAL};
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant (shop) gets its own Engine + WAL + compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    compact_interval: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            compact_interval: DEFAULT_COMPACT_INTERVAL,
        }
    }

    /// Create the data directory if needed and build a manager from `config`.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let mut manager = Self::new(config.data_dir.clone(), config.compact_threshold);
        manager.compact_interval = config.compact_interval;
        Ok(manager)
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        validate_tenant_name(tenant)?;

        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        let period = self.compact_interval;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold, period).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened tenant {tenant}");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

/// The tenant name doubles as the WAL file stem, so it must map one-to-one
/// onto a file inside the data directory.
fn validate_tenant_name(tenant: &str) -> std::io::Result<()> {
    if tenant.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid tenant name",
        ));
    }
    Ok(())
}
