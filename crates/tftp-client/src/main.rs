//! TFTP client executable.
//!
//! With `-f` the named remote file is downloaded into the `-t` path, which
//! must not exist yet. Without `-f` standard input is uploaded and stored on
//! the server under the `-t` path.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tftp::{ClientConfig, Mode, OptionKey, OptionSet};

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client - download a remote file or upload standard input",
    example = "Download a file:\n  {command_name} -h 10.0.1.50 -f boot.img -t ./boot.img",
    example = "Upload standard input:\n  cat notes.txt | {command_name} -h 10.0.1.50 -t notes.txt",
    example = "Negotiate a bigger block size:\n  {command_name} -h 10.0.1.50 -f big.iso -t big.iso --blksize 8192"
)]
struct Cli {
    #[argh(option, short = 'h', description = "hostname or IP address of the server")]
    host: String,

    #[argh(
        option,
        short = 'p',
        description = "server port to send the request to (default 69)",
        default = "tftp::DEFAULT_PORT"
    )]
    port: u16,

    #[argh(
        option,
        short = 'f',
        description = "remote file to download; without it, standard input is uploaded"
    )]
    file: Option<String>,

    #[argh(
        option,
        short = 't',
        description = "destination path: local for a download, remote for an upload"
    )]
    target: String,

    #[argh(
        option,
        short = 'm',
        description = "transfer mode, octet or netascii (default octet)",
        default = "Mode::Octet"
    )]
    mode: Mode,

    #[argh(option, description = "propose a block size in bytes (8-65464)")]
    blksize: Option<u64>,

    #[argh(option, description = "propose a retransmission timeout in seconds (1-255)")]
    timeout: Option<u64>,

    #[argh(switch, description = "negotiate the transfer size up front")]
    tsize: bool,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let mut options = OptionSet::new();
        if let Some(blksize) = self.blksize {
            options.set(OptionKey::BlockSize, blksize);
        }
        if let Some(timeout) = self.timeout {
            options.set(OptionKey::Timeout, timeout);
        }
        if self.tsize {
            // 0 asks the server for the size on a download; the upload path
            // fills in the staged size itself
            options.set(OptionKey::TransferSize, 0);
        }
        ClientConfig {
            mode: self.mode,
            options,
            ..Default::default()
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {}", host))?
        .next()
        .with_context(|| format!("no address for {}", host))
}

async fn run(cli: Cli) -> Result<()> {
    let server = resolve(&cli.host, cli.port).await?;
    let config = cli.client_config();

    match &cli.file {
        Some(remote) => {
            let dest = PathBuf::from(&cli.target);
            tftp::download(server, remote, &dest, &config)
                .await
                .with_context(|| format!("download of \"{}\" from {} failed", remote, server))?;
            tracing::info!("downloaded \"{}\" to {}", remote, dest.display());
        }
        None => {
            let mut stdin = tokio::io::stdin();
            tftp::upload(server, &cli.target, &mut stdin, &config)
                .await
                .with_context(|| format!("upload to \"{}\" on {} failed", cli.target, server))?;
            tracing::info!("uploaded standard input to \"{}\"", cli.target);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();

    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted");
        }
    }
}
