//! Registry of named shard connections.

use std::collections::HashMap;

use crate::{ConnectionParameters, DbError, DbWorker};

/// Builds a worker for a shard's parameters; injected so the registry stays
/// independent of the backend crates.
pub type WorkerFactory =
    Box<dyn Fn(&ConnectionParameters) -> Result<Box<dyn DbWorker>, DbError> + Send + Sync>;

struct Shard {
    parameters: ConnectionParameters,
    worker: Option<Box<dyn DbWorker>>,
}

/// Named shard connection registry.
///
/// Each registered shard gets exactly one cached worker for the lifetime of
/// the manager, guaranteeing at most one live connection per shard per
/// process. The worker is built on first access, or at registration when the
/// shard's parameters set `autoconnect`. Not designed for concurrent access
/// from multiple tasks without external locking.
pub struct ShardManager {
    factory: WorkerFactory,
    shards: HashMap<String, Shard>,
}

impl ShardManager {
    pub fn new(factory: WorkerFactory) -> Self {
        Self {
            factory,
            shards: HashMap::new(),
        }
    }

    /// Register a shard. Duplicate registration is a programming error, not
    /// a runtime condition to recover from. With `autoconnect` set, the
    /// worker is built and connected here instead of on first access.
    pub async fn register_shard(
        &mut self,
        name: &str,
        parameters: ConnectionParameters,
    ) -> Result<(), DbError> {
        if name.is_empty() {
            return Err(DbError::Configuration("shard name is empty".into()));
        }
        if self.shards.contains_key(name) {
            return Err(DbError::Configuration(format!(
                "shard '{name}' is already registered"
            )));
        }
        let worker = if parameters.autoconnect {
            Some(build_worker(&self.factory, &parameters).await?)
        } else {
            None
        };
        self.shards
            .insert(name.to_string(), Shard { parameters, worker });
        Ok(())
    }

    pub fn has_shard(&self, name: &str) -> bool {
        self.shards.contains_key(name)
    }

    /// The cached worker for a shard, constructed, initialized, and
    /// connected on first access only. `Ok(None)` for an unknown name.
    pub async fn dbshard(&mut self, name: &str) -> Result<Option<&mut (dyn DbWorker + 'static)>, DbError> {
        let Some(shard) = self.shards.get_mut(name) else {
            return Ok(None);
        };
        if shard.worker.is_none() {
            shard.worker = Some(build_worker(&self.factory, &shard.parameters).await?);
        }
        Ok(shard.worker.as_deref_mut())
    }

    /// Close every cached worker.
    pub async fn close_all(&mut self) -> Result<(), DbError> {
        for shard in self.shards.values_mut() {
            if let Some(worker) = shard.worker.as_deref_mut() {
                worker.close_connection().await?;
            }
        }
        Ok(())
    }
}

async fn build_worker(
    factory: &WorkerFactory,
    parameters: &ConnectionParameters,
) -> Result<Box<dyn DbWorker>, DbError> {
    let mut worker = factory(parameters)?;
    worker.init(parameters.clone())?;
    worker.connect().await?;
    Ok(worker)
}
