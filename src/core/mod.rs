use crate::config::{Config, Profile};
use crate::s3::{HttpExecutor, HyperExecutor, S3Client};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// State shared by every CLI command
///
/// One executor is created and shared by every client built from it, so all
/// profiles reuse the same HTTP connection pool.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    executor: Arc<dyn HttpExecutor>,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        let mut executor = HyperExecutor::new(config.insecure_tls)
            .context("Failed to create HTTP client")?;
        if let Some(secs) = config.request_timeout_secs {
            executor = executor.with_timeout(Duration::from_secs(secs));
        }
        Ok(Self::with_executor(config, Arc::new(executor)))
    }

    /// Use a caller-supplied executor instead of the default hyper client
    pub fn with_executor(config: Config, executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
        }
    }

    /// Look up a profile, falling back to the default one
    pub fn profile(&self, name: Option<&str>) -> Result<&Profile> {
        match name {
            Some(name) => self
                .config
                .get_profile(Some(name))
                .ok_or_else(|| anyhow::anyhow!("Profile '{}' not found", name)),
            None => self
                .config
                .get_profile(None)
                .ok_or_else(|| anyhow::anyhow!("No default profile configured; pass --profile")),
        }
    }

    /// Client for a profile; clones share the executor
    pub fn client(&self, name: Option<&str>) -> Result<S3Client> {
        self.profile(name)?
            .client(self.executor.clone(), &self.config.transfer)
    }

    /// Resolve a bucket argument against the profile's default bucket
    pub fn bucket(&self, profile: Option<&str>, bucket: Option<&str>) -> Result<String> {
        if let Some(bucket) = bucket {
            return Ok(bucket.to_string());
        }
        self.profile(profile)?
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No bucket given and the profile has no default bucket"))
    }
}
