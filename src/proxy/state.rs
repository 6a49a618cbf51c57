use crate::models::AppConfig;
use crate::modules::persistence::accounts::CredentialStore;
use crate::proxy::dispatch::Dispatcher;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Clone)]
pub struct Core {
    pub pool: Arc<AccountPool>,
    pub dispatcher: Arc<Dispatcher>,
}

// Shared handler state. Core construction is gated by a OnceCell so
// concurrent first requests wait on a single initialisation.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    store: Arc<CredentialStore>,
    core: Arc<OnceCell<Core>>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<CredentialStore>) -> Self {
        Self {
            config,
            store,
            core: Arc::new(OnceCell::new()),
        }
    }

    pub fn store(&self) -> Arc<CredentialStore> {
        self.store.clone()
    }

    pub async fn core(&self) -> &Core {
        self.core
            .get_or_init(|| async {
                let pool =
                    Arc::new(AccountPool::new(self.store.clone(), self.config.clone()).await);
                let upstream = Arc::new(UpstreamClient::new(
                    self.config.proxy.upstream_proxy_url.as_deref(),
                ));
                let dispatcher = Arc::new(Dispatcher {
                    pool: pool.clone(),
                    upstream,
                    config: self.config.dispatch.clone(),
                });
                tracing::info!("[State] Core initialized");
                Core { pool, dispatcher }
            })
            .await
    }
}
