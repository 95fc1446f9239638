//! Gateway bootstrap: wires every collaborator from configuration, binds the
//! listener, and runs with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router;
use super::state::{AppState, RouteTable};
use crate::config::Config;
use crate::directory::InMemoryUserDirectory;
use crate::error::{Error, Result};
use crate::orchestrator::AuthOrchestrator;
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::session::SessionRegistry;
use crate::store::{InMemoryStore, KeyValueStore};
use crate::token::TokenService;

/// The identity gateway server.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Gateway {
    /// Build a gateway from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret store master key is too short, or if
    /// `RS256` is selected without configured signing keys.
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let tokens = Arc::new(TokenService::new(&config.auth, store.clone())?);
        let sessions = Arc::new(SessionRegistry::new(config.session.clone(), tokens.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), store.clone()));
        let policy = Arc::new(PolicyEngine::new(store.clone()));
        let directory = Arc::new(InMemoryUserDirectory::new());

        let orchestrator = Arc::new(AuthOrchestrator::new(
            config.auth.clone(),
            directory,
            tokens.clone(),
            sessions,
            rate_limiter.clone(),
            policy,
            config.policy.password.clone(),
            config.policy.ip.clone(),
        ));

        let http_client = reqwest::Client::builder()
            .connect_timeout(config.server.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build downstream http client: {e}")))?;

        let state = Arc::new(AppState {
            orchestrator,
            tokens,
            rate_limiter,
            routes: RouteTable::new(config.routes.clone()),
            cors: config.cors.clone(),
            http_client,
            default_request_timeout: config.server.request_timeout,
        });

        Ok(Self {
            config,
            state,
            shutdown_tx: None,
        })
    }

    /// Run the gateway until a shutdown signal is received, draining
    /// in-flight requests before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured host/port cannot be bound.
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Internal(format!("invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let app = router::build(self.state.clone());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, "Gateway listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        let drain_timeout = self.config.server.shutdown_timeout;
        info!(timeout = ?drain_timeout, "Shutdown signal handled, connections drained by axum::serve");

        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    warn!("draining in-flight requests");
}
