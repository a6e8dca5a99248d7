//! HTTPS accept loop.
//!
//! Each accepted connection runs the rustls handshake, captures the client's
//! certificate chain, and serves the router with that chain attached to every
//! request as [`PeerCertificates`].

use std::future::Future;

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::certauth::PeerCertificates;
use crate::Result;

/// Serve `app` over TLS until `shutdown` resolves.
///
/// Stops accepting on shutdown; connections already being served finish on
/// their own tasks.
pub async fn serve_tls<F>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    // Transient (EMFILE, ECONNABORTED); keep accepting.
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
            () = &mut shutdown => {
                info!("TLS listener stopped");
                return Ok(());
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(%remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let chain = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default();
            let peer = PeerCertificates::new(chain);
            debug!(%remote_addr, client_certs = peer.0.len(), "TLS connection established");

            let service = TowerToHyperService::new(app.layer(Extension(peer)));
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%remote_addr, error = %e, "Connection closed with error");
            }
        });
    }
}
