use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use metrics::{api_io_stats, init_provider};
use state_store::EdgeState;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    routes::{create_routes, routes_state::RouteState},
    tunnels::TunnelService,
    update_schedules::UpdateScheduleTracker,
};

#[derive(Clone)]
pub struct Service {
    pub config: Arc<ServerConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub edge_state: Arc<EdgeState>,
    pub tunnels: Arc<TunnelService>,
    pub update_schedules: Arc<UpdateScheduleTracker>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            config.telemetry.instance_id.as_ref(),
            env!("CARGO_PKG_VERSION"),
        )?;

        let edge_state = EdgeState::new(
            config.state_store_path.parse()?,
            config.rocksdb_config.clone(),
            config.status_cache.clone(),
        )
        .await
        .context("error initializing the state store")?;
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );

        let tunnels = Arc::new(TunnelService::new(
            config.edge.tunnel_port_range,
            config.edge.tunnel_idle_timeout(),
        ));
        tunnels
            .rebuild_jobs(&edge_state.reader())
            .await
            .context("error loading edge job queues")?;

        let update_schedules = UpdateScheduleTracker::new(
            edge_state.clone(),
            config.edge.update_reconcile_delay(),
            shutdown_rx.clone(),
        )?;

        Ok(Self {
            config: Arc::new(config),
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            edge_state,
            tunnels,
            update_schedules,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            edge_state: self.edge_state.clone(),
            blob_storage: self.blob_storage.clone(),
            tunnels: self.tunnels.clone(),
            update_schedules: self.update_schedules.clone(),
            metrics: Arc::new(api_io_stats::Metrics::new()),
            config: self.config.clone(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let tunnels = self.tunnels.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tunnels.start_idle_monitor(shutdown_rx).await;
        });

        let global_meter = opentelemetry::global::meter("edge-server");
        let otel_metrics_service_layer = tower_otel_http_metrics::HTTPMetricsLayerBuilder::builder()
            .with_meter(global_meter)
            .build()
            .map_err(|e| anyhow!("error building http metrics layer: {:?}", e))?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state()).layer(otel_metrics_service_layer);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        error!("no background task is listening for shutdown");
    }
    info!("signal received, shutting down server gracefully");
}
