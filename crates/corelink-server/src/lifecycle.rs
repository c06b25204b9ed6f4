//! Startup and shutdown of the dashboard server.

use std::{future::Future, sync::Arc};

use anyhow::Context;
use corelink_executor::{HostSpawner, PresetCatalog};
use corelink_host::{DockerCollector, GpuSampler, SystemSampler};
use corelink_session::{ChannelRegistry, Collaborators, SampleHub, SamplePoller};
use tokio::net::TcpListener;

use crate::{
    config::Config,
    routes::{self, AppState},
};

/// Host collaborators behind the registry and the HTTP routes.
#[derive(Debug)]
pub struct Services {
    pub docker: DockerCollector,
    pub gpu: GpuSampler,
    pub system: SystemSampler,
}

impl Services {
    /// Connect to the configured host.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            docker: DockerCollector::connect(&config.docker_socket),
            gpu: GpuSampler::new(config.has_gpu, config.execution_context()),
            system: SystemSampler::new(),
        }
    }
}

/// Everything that lives for the duration of the server.
pub struct Runtime {
    state: AppState,
    pollers: Vec<SamplePoller>,
}

impl Runtime {
    /// Build the registry and start one poller per sample type.
    #[must_use]
    pub fn start(config: &Config, services: Services) -> Self {
        let Services {
            docker,
            gpu,
            system,
        } = services;
        let gpu = Arc::new(gpu);
        let system = Arc::new(system);
        let hub = Arc::new(SampleHub::new());

        let registry = Arc::new(ChannelRegistry::new(
            Collaborators {
                spawner: Arc::new(HostSpawner::new(config.execution_context())),
                log_source: Arc::new(docker.clone()),
                hub: Arc::clone(&hub),
                policy: config.policy(),
                presets: PresetCatalog::builtin(),
            },
            config.registry_config(),
        ));

        // A disabled GPU sampler still ticks so /api/gpu/ws sees empty readings.
        let pollers = vec![
            SamplePoller::start(system.clone(), Arc::clone(&hub), config.system_interval()),
            SamplePoller::start(gpu.clone(), Arc::clone(&hub), config.gpu_interval()),
        ];

        tracing::info!(
            context = ?config.execution_context(),
            docker = docker.is_available(),
            gpu = gpu.is_enabled(),
            pollers = pollers.len(),
            "Runtime started"
        );

        Self {
            state: AppState {
                registry,
                docker,
                gpu,
                system,
                container_pattern: config.container_pattern.clone(),
            },
            pollers,
        }
    }

    /// Serve until `shutdown` resolves, then stop the pollers and drain the
    /// registry.
    ///
    /// # Errors
    /// Returns error if the server fails.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self { state, mut pollers } = self;
        let registry = Arc::clone(&state.registry);
        let app = routes::create_router(state);

        let drain = async move {
            shutdown.await;
            tracing::info!("Shutting down");
            for poller in &mut pollers {
                poller.stop().await;
            }
            let released = registry.shutdown().await;
            let cancelled = released.iter().filter(|r| r.session_cancelled).count();
            tracing::info!(
                channels = released.len(),
                sessions_cancelled = cancelled,
                "Registry drained"
            );
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(drain)
            .await
            .context("server terminated with an error")?;

        tracing::info!("Server stopped");
        Ok(())
    }
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Ctrl-C received"),
        () = terminate => tracing::info!("SIGTERM received"),
    }
}

/// Bind the configured address and serve until a shutdown signal.
///
/// # Errors
/// Returns error if the address cannot be bound or the server fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Dashboard listening on http://{addr}");

    let runtime = Runtime::start(&config, Services::from_config(&config));
    runtime.serve(listener, shutdown_signal()).await
}
