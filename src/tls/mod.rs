//! In-process TLS termination.
//!
//! Used when `tls.enabled` is set. Without it the server speaks plain HTTP
//! behind a reverse proxy, and the client certificate arrives in a header.
//!
//! - [`config`]: `rustls::ServerConfig` building and PEM loading
//! - [`listener`]: accept loop publishing [`PeerCertificates`](crate::certauth::PeerCertificates)

pub mod config;
pub mod listener;

pub use config::{AcceptAnyClientCert, build_tls_config, load_certs, load_private_key};
pub use listener::serve_tls;
