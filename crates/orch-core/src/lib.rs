//! Orchestration core: clock/id generation, the in-process event bus, the
//! agent lifecycle state machine, the team orchestrator, and startup
//! recovery.
//!
//! This crate owns policy; `orch-db` owns storage and `orch-gateway` owns
//! the remote tool-executor connection. A caller (the excluded API/CLI
//! surface) wires the three together via [`Orchestrator::init`].

pub mod clock;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod orchestrator;
pub mod recovery;
pub mod state;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

pub use error::OrchError;
pub use event_bus::EventBus;
pub use lifecycle::{LifecycleManager, SpawnOptions};
pub use orchestrator::{ScaleOutcome, TeamCreateConfig, TeamOrchestrator};
pub use recovery::RecoveryReport;

use orch_gateway::{GatewayClient, GatewayConfig, GatewayEvent};

/// Everything a process embedding the orchestrator needs: the lifecycle
/// manager, the team orchestrator, and the event bus they publish to.
pub struct Orchestrator {
    pub lifecycle: Arc<LifecycleManager>,
    pub teams: Arc<TeamOrchestrator>,
    pub events: EventBus,
}

impl Orchestrator {
    /// Connect to the gateway, run startup recovery, and wire up the
    /// lifecycle/orchestrator layers. The returned gateway event loop must
    /// be driven by the caller (typically `tokio::spawn`ed) for gateway
    /// events to reach the lifecycle manager.
    pub async fn init(
        pool: PgPool,
        gateway_config: GatewayConfig,
    ) -> Result<(Self, RecoveryReport, impl std::future::Future<Output = ()>), OrchError> {
        let events = EventBus::new();

        let report = recovery::recover_all(&pool, &events).await;

        let (gw_tx, gw_rx) = mpsc::channel::<GatewayEvent>(256);
        let strict = gateway_config.strict;
        let gateway = GatewayClient::connect(gateway_config, gw_tx).await?;

        let lifecycle = Arc::new(LifecycleManager::new(
            pool.clone(),
            gateway,
            events.clone(),
            strict,
        ));
        lifecycle.start().await;

        let teams = Arc::new(TeamOrchestrator::new(pool.clone(), lifecycle.clone(), events.clone()));

        let event_loop = lifecycle::run_gateway_event_loop(pool, lifecycle.clone(), events.clone(), gw_rx);

        Ok((
            Self {
                lifecycle,
                teams,
                events,
            },
            report,
            event_loop,
        ))
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.teams.checkpoint_active_teams().await {
            tracing::warn!(error = %e, "failed to checkpoint active teams during shutdown");
        }
        self.lifecycle.stop().await;
    }
}
