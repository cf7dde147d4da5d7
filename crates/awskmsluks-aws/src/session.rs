//! Blocking bridge onto the async AWS SDK.
//!
//! The rest of awskmsluks is synchronous; a single current-thread runtime is
//! built per process and every SDK call is driven to completion on it.

use aws_config::{BehaviorVersion, SdkConfig};
use awskmsluks_core::error::{KmsLuksError, KmsLuksResult};
use log::debug;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// Shared runtime plus the default AWS configuration (credentials, region chain).
#[derive(Clone)]
pub struct AwsSession {
    runtime: Arc<Runtime>,
    config: Arc<SdkConfig>,
}

impl AwsSession {
    /// Build the runtime and load the default AWS configuration chain.
    pub fn load() -> KmsLuksResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| KmsLuksError::Config(format!("unable to start AWS runtime: {err}")))?;
        let config = runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).load());
        debug!(
            "loaded AWS configuration (default region: {})",
            config
                .region()
                .map(|region| region.as_ref())
                .unwrap_or("unset")
        );
        Ok(Self {
            runtime: Arc::new(runtime),
            config: Arc::new(config),
        })
    }

    pub fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
