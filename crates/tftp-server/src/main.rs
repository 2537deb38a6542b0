//! TFTP server executable.
//!
//! Serves downloads from, and accepts uploads into, the given root
//! directory. Every transfer runs on its own ephemeral port, so many clients
//! can be served at once.

use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{ServerConfig, TftpServer};

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server - serve files from a directory over UDP",
    example = "Serve /srv/tftp on the well-known port:\n  {command_name} /srv/tftp",
    example = "Unprivileged port for testing:\n  {command_name} -p 6969 ./tftp_root"
)]
struct Cli {
    #[argh(
        option,
        short = 'p',
        description = "port to listen on (default 69)",
        default = "tftp::DEFAULT_PORT"
    )]
    port: u16,

    #[argh(option, short = 'b', description = "address to bind (default 0.0.0.0)", default = "\"0.0.0.0\".to_string()")]
    bind: String,

    #[argh(positional, description = "directory to serve files from")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("root directory {} is not usable", cli.root.display()))?;

    let mut server = TftpServer::new(ServerConfig {
        bind_address: format!("{}:{}", cli.bind, cli.port),
        root_dir: root,
    });

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
