//! HTTP(S) server

pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

pub use router::{AppState, create_router};

use crate::certauth::{CertAuth, CertAuthPipeline};
use crate::config::{Config, ExtractorKind, VerifierKind};
use crate::storage::{CertAuthStore, open_store};
use crate::webhook::{EventSink, event_sink};
use crate::{Error, Result};

/// Certificate-authenticating MDM endpoint server
pub struct Server {
    config: Config,
    store: Arc<dyn CertAuthStore>,
    events: Arc<dyn EventSink>,
}

impl Server {
    /// Open the association store and prepare the server.
    pub async fn new(config: Config) -> Result<Self> {
        let store = open_store(&config.storage).await?;
        let events = event_sink(&config.webhook)?;
        Ok(Self::with_parts(config, store, events))
    }

    /// Server over an existing store and event sink.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn CertAuthStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            store,
            events,
        }
    }

    /// The router with pipeline and handlers wired from configuration.
    pub fn router(&self) -> axum::Router {
        let pipeline = Arc::new(CertAuthPipeline::from_config(
            &self.config.certauth,
            self.config.server.max_body_size,
            Arc::clone(&self.store),
        ));
        let state = Arc::new(AppState {
            certauth: Arc::new(CertAuth::from_config(
                Arc::clone(&self.store),
                &self.config.certauth,
            )),
            events: Arc::clone(&self.events),
            max_body_size: self.config.server.max_body_size,
        });
        create_router(state, pipeline, self.config.server.request_timeout)
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind {addr}: {e}")))?;

        self.log_banner();

        if self.config.tls.enabled {
            let tls_config = crate::tls::build_tls_config(&self.config.tls)?;
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            crate::tls::serve_tls(listener, acceptor, app, shutdown_signal()).await?;
        } else {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("Server stopped");
        Ok(())
    }

    fn log_banner(&self) {
        let certauth = &self.config.certauth;
        let scheme = if self.config.tls.enabled { "https" } else { "http" };

        info!("============================================================");
        info!("MDM CERTAUTH v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(
            "Listening on {scheme}://{}:{}",
            self.config.server.host, self.config.server.port
        );
        info!(extractors = ?certauth.extractors, composition = ?certauth.composition, "Certificate extraction");
        info!(
            verifier = ?certauth.verifier,
            allow_retroactive = certauth.allow_retroactive,
            allow_duplicates = certauth.allow_duplicates,
            "Certificate verification"
        );
        if certauth.verifier == VerifierKind::AllowAll {
            warn!("VERIFIER allow_all - certificates are not checked against the store");
        }
        if certauth.extractors.contains(&ExtractorKind::Header) && self.config.tls.enabled {
            warn!(header = %certauth.header_name, "Header extractor enabled on a TLS listener; clients can set this header themselves");
        }
        match &self.config.webhook.url {
            Some(url) => info!(%url, "Webhook enabled"),
            None => info!("Webhook disabled"),
        }
        info!("============================================================");
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
