//! The coordinator process: store, registry, scheduler, session server, and
//! the submission API, wired together at startup.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::server::{SessionContext, SessionServer};
use crate::store::Store;

pub struct Coordinator {
    pub config: Arc<CoordinatorConfig>,
    pub store: Store,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
}

impl Coordinator {
    /// Open the store and build the components. No tasks run yet.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        let store = Store::open(&config.db_path).await?;
        let registry = Arc::new(WorkerRegistry::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            config.credits.clone(),
            config.limits.clone(),
            config.artifacts_dir.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            scheduler,
        })
    }

    /// Run all coordinator subsystems until the token is cancelled:
    ///
    /// 1. The periodic reaper (stalled and overdue jobs)
    /// 2. The submission API server
    /// 3. The worker session server (this call blocks on it)
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let server = self.spawn_background(&cancel);
        server.run(cancel).await
    }

    /// Like [`Self::run`], but reports the session server's bound address
    /// through `addr_tx` once listening. Lets callers configure port 0.
    pub async fn run_with_bound_addr(
        self,
        cancel: CancellationToken,
        addr_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    ) -> Result<()> {
        let server = self.spawn_background(&cancel);
        let (listener, addr) = server.bind().await?;
        let _ = addr_tx.send(addr);
        server.serve(listener, cancel).await
    }

    /// Spawn the reaper and API tasks; return the session server ready to
    /// accept workers.
    fn spawn_background(self, cancel: &CancellationToken) -> SessionServer {
        let reaper = self.scheduler.clone();
        let reaper_cancel = cancel.clone();
        let reaper_interval = self.config.reaper_interval;
        let stall_grace = self.config.stall_grace;
        tokio::spawn(async move {
            reaper
                .run_reaper(reaper_interval, stall_grace, reaper_cancel)
                .await;
        });

        let api_state = ApiState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            policy: self.config.credits.clone(),
            limits: self.config.limits.clone(),
        };
        let api_addr = self.config.api_listen_addr;
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            run_api(api_addr, api_state, api_cancel).await;
        });

        SessionServer::new(SessionContext {
            config: self.config,
            store: self.store,
            registry: self.registry,
            scheduler: self.scheduler,
        })
    }
}
