/// Plugin asset server sidecar.
/// Spawned by the Ouroboros host with the plugins directory and a fixed port;
/// exits on SIGTERM / Ctrl-C or when the host kills it.
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ouroboros-asset-server", version, about = "Serve installed plugins over loopback HTTP")]
struct Args {
    /// Plugins directory to serve.
    root: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Address to bind. Loopback unless you know what you are doing.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if !args.root.is_dir() {
        anyhow::bail!("plugins directory {} does not exist", args.root.display());
    }

    ouroboros_asset_server::serve(args.root, SocketAddr::new(args.host, args.port)).await
}
