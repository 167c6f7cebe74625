//! Named factories for swappable collaborators
//!
//! The service picks its vector backend, embedder and load probe by the names
//! in `Config`. Embedding applications can register their own factories under
//! new names before building the service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use lancedb::connection::Connection;

use crate::config::Config;
use crate::error::{KeepsakeError, Result};
use crate::eviction::retention::{LoadAverageProbe, StaticLoad, SystemLoadProbe};
use crate::vector::{Embedder, HashEmbedder, InMemoryVectorIndex, LanceVectorIndex, VectorIndex};

/// Everything a factory may need to build its component
#[derive(Clone)]
pub struct PluginContext {
    pub config: Config,
    pub data_dir: PathBuf,
    /// Open LanceDB connection when the store is persistent
    pub connection: Option<Connection>,
}

impl PluginContext {
    pub fn new(config: Config) -> Self {
        let data_dir = config.storage.data_dir.clone();
        Self {
            config,
            data_dir,
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }
}

pub type VectorFactory =
    Arc<dyn Fn(PluginContext) -> BoxFuture<'static, Result<Arc<dyn VectorIndex>>> + Send + Sync>;
pub type EmbedderFactory = Arc<dyn Fn(&PluginContext) -> Result<Arc<dyn Embedder>> + Send + Sync>;
pub type LoadProbeFactory =
    Arc<dyn Fn(&PluginContext) -> Result<Arc<dyn SystemLoadProbe>> + Send + Sync>;

/// Vector backend name that disables vector search
pub const NO_VECTOR_BACKEND: &str = "none";

#[derive(Default)]
pub struct PluginRegistry {
    vector_backends: HashMap<String, VectorFactory>,
    embedders: HashMap<String, EmbedderFactory>,
    load_probes: HashMap<String, LoadProbeFactory>,
}

impl PluginRegistry {
    /// Registry without any factories
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.vector_backends.insert(
            "memory".to_string(),
            Arc::new(|_ctx: PluginContext| -> BoxFuture<'static, Result<Arc<dyn VectorIndex>>> {
                Box::pin(async {
                    Ok::<Arc<dyn VectorIndex>, KeepsakeError>(Arc::new(InMemoryVectorIndex::new()))
                })
            }),
        );
        registry.vector_backends.insert(
            "lance".to_string(),
            Arc::new(|ctx: PluginContext| -> BoxFuture<'static, Result<Arc<dyn VectorIndex>>> {
                Box::pin(async move {
                    let dimension = ctx.config.vector.dimension;
                    let index = match &ctx.connection {
                        Some(connection) => {
                            LanceVectorIndex::with_connection(connection, dimension).await?
                        }
                        None => LanceVectorIndex::open(&ctx.data_dir, dimension).await?,
                    };
                    Ok::<Arc<dyn VectorIndex>, KeepsakeError>(Arc::new(index))
                })
            }),
        );

        registry.embedders.insert(
            "hash".to_string(),
            Arc::new(|ctx: &PluginContext| -> Result<Arc<dyn Embedder>> {
                Ok(Arc::new(HashEmbedder::new(ctx.config.vector.dimension)) as Arc<dyn Embedder>)
            }),
        );
        #[cfg(feature = "fastembed")]
        registry.embedders.insert(
            "fastembed".to_string(),
            Arc::new(|_ctx: &PluginContext| -> Result<Arc<dyn Embedder>> {
                Ok(Arc::new(crate::vector::FastEmbedder::new()?) as Arc<dyn Embedder>)
            }),
        );

        registry.load_probes.insert(
            "static".to_string(),
            Arc::new(|ctx: &PluginContext| -> Result<Arc<dyn SystemLoadProbe>> {
                Ok(Arc::new(StaticLoad(ctx.config.retention.static_load)) as Arc<dyn SystemLoadProbe>)
            }),
        );
        registry.load_probes.insert(
            "loadavg".to_string(),
            Arc::new(|ctx: &PluginContext| -> Result<Arc<dyn SystemLoadProbe>> {
                Ok(Arc::new(LoadAverageProbe::new(ctx.config.retention.static_load))
                    as Arc<dyn SystemLoadProbe>)
            }),
        );

        registry
    }

    pub fn register_vector_backend(&mut self, name: &str, factory: VectorFactory) -> Result<()> {
        register(&mut self.vector_backends, "vector backend", name, factory)
    }

    pub fn register_embedder(&mut self, name: &str, factory: EmbedderFactory) -> Result<()> {
        register(&mut self.embedders, "embedder", name, factory)
    }

    pub fn register_load_probe(&mut self, name: &str, factory: LoadProbeFactory) -> Result<()> {
        register(&mut self.load_probes, "load probe", name, factory)
    }

    /// Build the named vector index; `none` yields no index
    pub async fn vector_index(
        &self,
        name: &str,
        ctx: &PluginContext,
    ) -> Result<Option<Arc<dyn VectorIndex>>> {
        if name == NO_VECTOR_BACKEND {
            return Ok(None);
        }
        let factory = self
            .vector_backends
            .get(name)
            .ok_or_else(|| unknown("vector backend", name, self.vector_backends.keys()))?;
        factory(ctx.clone()).await.map(Some)
    }

    pub fn embedder(&self, name: &str, ctx: &PluginContext) -> Result<Arc<dyn Embedder>> {
        let factory = self
            .embedders
            .get(name)
            .ok_or_else(|| unknown("embedder", name, self.embedders.keys()))?;
        factory(ctx)
    }

    pub fn load_probe(&self, name: &str, ctx: &PluginContext) -> Result<Arc<dyn SystemLoadProbe>> {
        let factory = self
            .load_probes
            .get(name)
            .ok_or_else(|| unknown("load probe", name, self.load_probes.keys()))?;
        factory(ctx)
    }

    pub fn vector_backend_names(&self) -> Vec<String> {
        sorted_names(self.vector_backends.keys())
    }

    pub fn embedder_names(&self) -> Vec<String> {
        sorted_names(self.embedders.keys())
    }

    pub fn load_probe_names(&self) -> Vec<String> {
        sorted_names(self.load_probes.keys())
    }
}

fn register<F>(map: &mut HashMap<String, F>, kind: &str, name: &str, factory: F) -> Result<()> {
    if map.contains_key(name) {
        return Err(KeepsakeError::Plugin(format!(
            "A {kind} named '{name}' is already registered"
        )));
    }
    map.insert(name.to_string(), factory);
    Ok(())
}

fn unknown<'a>(kind: &str, name: &str, known: impl Iterator<Item = &'a String>) -> KeepsakeError {
    KeepsakeError::Plugin(format!(
        "Unknown {kind} '{name}' (available: {})",
        sorted_names(known).join(", ")
    ))
}

fn sorted_names<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = names.cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    fn pegged_probe(_ctx: &PluginContext) -> Result<Arc<dyn SystemLoadProbe>> {
        Ok(Arc::new(StaticLoad(1.0)))
    }

    #[test]
    fn test_defaults_are_registered() {
        let registry = PluginRegistry::with_defaults();
        assert_eq!(registry.vector_backend_names(), vec!["lance", "memory"]);
        assert!(registry.embedder_names().contains(&"hash".to_string()));
        assert_eq!(registry.load_probe_names(), vec!["loadavg", "static"]);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::with_defaults();
        let err = registry
            .register_load_probe(
                "static",
                Arc::new(pegged_probe),
            )
            .unwrap_err();
        assert!(matches!(err, KeepsakeError::Plugin(_)));
    }

    #[test]
    fn test_custom_probe_is_used() {
        let mut registry = PluginRegistry::with_defaults();
        registry
            .register_load_probe(
                "pegged",
                Arc::new(pegged_probe),
            )
            .unwrap();

        let probe = registry
            .load_probe("pegged", &PluginContext::new(test_config()))
            .unwrap();
        assert_eq!(probe.load(), 1.0);
    }

    #[tokio::test]
    async fn test_vector_backend_lookup() {
        let registry = PluginRegistry::with_defaults();
        let ctx = PluginContext::new(test_config());

        let index = registry.vector_index("memory", &ctx).await.unwrap();
        assert_eq!(index.map(|i| i.name().to_string()), Some("memory".to_string()));
        assert!(registry.vector_index("none", &ctx).await.unwrap().is_none());

        let err = match registry.vector_index("qdrant", &ctx).await {
            Err(e) => e,
            Ok(_) => panic!("unknown backend should fail"),
        };
        assert!(err.to_string().contains("available: lance, memory"));
    }
}
