use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use ccgw_config::ConfigStore;
use ccgw_provider::Connector;
use ccgw_storage::GatewayStorage;

use crate::keys::ApiKeyService;
use crate::session::SessionStore;

/// Shared per-process state. One instance lives behind an `Arc` for the
/// lifetime of the server.
pub struct GatewayState {
    pub config: Arc<ConfigStore>,
    pub storage: GatewayStorage,
    pub connector: Arc<dyn Connector>,
    pub keys: ApiKeyService,
    pub sessions: SessionStore,
    active_requests: AtomicI64,
}

impl GatewayState {
    pub fn new(
        config: Arc<ConfigStore>,
        storage: GatewayStorage,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let keys = ApiKeyService::new(storage.clone(), config.vault().clone());
        Arc::new(Self {
            config,
            storage,
            connector,
            keys,
            sessions: SessionStore::new(),
            active_requests: AtomicI64::new(0),
        })
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_request(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_request(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
