//! Builds providers for a model config and a backend choice.

use std::sync::Arc;

use super::direct::DirectProvider;
use super::native::NativeBackend;
use super::remote::RemoteProvider;
use super::server::ServerProvider;
use super::{Provider, ProviderHandle};
use crate::catalog::{BackendType, ModelConfig};
use crate::config::OrchestratorConfig;
use crate::supervisor::OrphanGuard;

#[derive(Clone)]
pub struct ProviderFactory {
    native: Arc<dyn NativeBackend>,
    client: reqwest::Client,
    config: Arc<OrchestratorConfig>,
    guard: Arc<OrphanGuard>,
}

impl ProviderFactory {
    pub fn new(
        native: Arc<dyn NativeBackend>,
        config: Arc<OrchestratorConfig>,
        guard: Arc<OrphanGuard>,
    ) -> Self {
        Self {
            native,
            client: reqwest::Client::new(),
            config,
            guard,
        }
    }

    pub fn native_backend(&self) -> &Arc<dyn NativeBackend> {
        &self.native
    }

    pub fn guard(&self) -> &Arc<OrphanGuard> {
        &self.guard
    }

    /// A fresh, uninitialized provider for `config` on `backend`.
    pub fn build(&self, config: &ModelConfig, backend: BackendType) -> ProviderHandle {
        let provider = match backend {
            BackendType::Direct => Provider::Direct(DirectProvider::new(
                config.clone(),
                self.native.clone(),
                self.config.direct.clone(),
            )),
            BackendType::Server => Provider::Server(ServerProvider::new(
                config.clone(),
                self.config.server.clone(),
                self.client.clone(),
                self.guard.clone(),
            )),
            BackendType::RemoteApi => Provider::Remote(RemoteProvider::new(
                config.clone(),
                &self.config.remote,
                self.client.clone(),
            )),
        };
        ProviderHandle::new(config.clone(), provider)
    }
}
