//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Device identity certificate authentication for MDM endpoints
#[derive(Parser, Debug)]
#[command(name = "mdm-certauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MDM_CERTAUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MDM_CERTAUTH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MDM_CERTAUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "MDM_CERTAUTH_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "MDM_CERTAUTH_HOST")]
        host: Option<String>,
    },

    /// Print the association hash of a PEM certificate
    Hash {
        /// PEM certificate file
        #[arg(required = true)]
        cert: PathBuf,
    },

    /// Bind a PEM certificate to an enrollment in the configured store,
    /// replacing any previous binding
    Associate {
        /// Enrollment identifier
        #[arg(required = true)]
        enrollment_id: String,

        /// PEM certificate file
        #[arg(required = true)]
        cert: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["mdm-certauth"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn serve_overrides_parse() {
        let cli = Cli::parse_from(["mdm-certauth", "serve", "--port", "8443", "--host", "0.0.0.0"]);
        match cli.command {
            Some(Command::Serve { port, host }) => {
                assert_eq!(port, Some(8443));
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn associate_takes_id_and_cert() {
        let cli = Cli::parse_from([
            "mdm-certauth",
            "--config",
            "certauth.yaml",
            "associate",
            "UDID-1",
            "device.pem",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("certauth.yaml")));
        match cli.command {
            Some(Command::Associate { enrollment_id, cert }) => {
                assert_eq!(enrollment_id, "UDID-1");
                assert_eq!(cert, PathBuf::from("device.pem"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
