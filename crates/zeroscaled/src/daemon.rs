//! Wires the poller, autoscaler, DLX proxy and admin API together.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use zeroscale_autoscale::{Activator, AutoScaler};
use zeroscale_dlx::{Dlx, RequestCounter};
use zeroscale_metrics::{MetricStore, Poller};
use zeroscale_state::{Registry, ResourceScaler, ResourceScalerConfig};

use crate::admin;

pub struct Daemon {
    config: ResourceScalerConfig,
    registry: Registry,
    poller: Arc<Poller>,
    scaler: AutoScaler,
    dlx: Dlx,
}

impl Daemon {
    /// Build every component around one registry. The DLX doubles as the
    /// poller's metrics source, serving its request counts.
    pub fn new(backend: Arc<dyn ResourceScaler>, config: ResourceScalerConfig) -> Self {
        let registry = Registry::new();
        let store = MetricStore::default();

        let activator = Activator::new(
            registry.clone(),
            Arc::clone(&backend),
            config.autoscaler.readiness_timeout,
        )
        .with_backend_timeout(config.autoscaler.backend_timeout);
        let dlx = Dlx::new(
            registry.clone(),
            activator.clone(),
            RequestCounter::new(),
            config.dlx.clone(),
        );
        let poller = Arc::new(Poller::new(
            registry.clone(),
            store.clone(),
            Arc::clone(&backend),
            Arc::new(dlx.clone()),
            config.poller.clone(),
        ));
        let scaler = AutoScaler::new(
            registry.clone(),
            store,
            backend,
            activator,
            config.autoscaler.clone(),
        );

        Self {
            config,
            registry,
            poller,
            scaler,
            dlx,
        }
    }

    /// Seed the configuration from the backend.
    pub async fn from_backend(backend: Arc<dyn ResourceScaler>) -> anyhow::Result<Self> {
        let config = backend
            .get_config()
            .await
            .context("loading scaler configuration from backend")?;
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &ResourceScalerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run until `shutdown` resolves, then stop the poller, the autoscaler
    /// and finally the DLX (after it drains) in that order.
    pub async fn run(
        self,
        dlx_listener: TcpListener,
        admin_listener: Option<TcpListener>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        let (poller_tx, poller_rx) = watch::channel(false);
        let (engine_tx, engine_rx) = watch::channel(false);
        let (serve_tx, serve_rx) = watch::channel(false);

        let poller = tokio::spawn(Arc::clone(&self.poller).run(poller_rx));
        let engine = {
            let scaler = self.scaler.clone();
            tokio::spawn(async move { scaler.run(engine_rx).await })
        };
        let dlx = tokio::spawn(self.dlx.clone().serve(dlx_listener, serve_rx.clone()));
        let admin = match admin_listener {
            Some(listener) => {
                info!(addr = %listener.local_addr()?, "admin API listening");
                let router = admin::build_router(self.registry.clone());
                let mut rx = serve_rx;
                Some(tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(async move {
                            let _ = rx.changed().await;
                        })
                        .await
                }))
            }
            None => None,
        };

        shutdown.await;
        info!("shutdown signal received");

        let _ = poller_tx.send(true);
        if let Err(e) = poller.await {
            error!(error = %e, "poller task failed");
        }

        let _ = engine_tx.send(true);
        if let Err(e) = engine.await {
            error!(error = %e, "autoscaler task failed");
        }

        let _ = serve_tx.send(true);
        dlx.await.context("dlx task failed")??;
        if let Some(admin) = admin {
            admin.await.context("admin task failed")??;
        }

        info!("zeroscaled stopped");
        Ok(())
    }
}
