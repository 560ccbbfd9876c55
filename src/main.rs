use clap::Parser;
use ouroboros_lib::RunOptions;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ouroboros", version, about = "Plugin host for the Ouroboros desktop app")]
struct Args {
    /// Directory holding config.json and the default plugins folder.
    #[arg(long, env = ouroboros_lib::config::CONFIG_DIR_ENV)]
    config_dir: Option<PathBuf>,

    /// Plugins directory (overrides config.json).
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    #[arg(long)]
    asset_server_port: Option<u16>,

    /// Shell API port; 0 picks a free one.
    #[arg(long)]
    shell_api_port: Option<u16>,

    /// Assume an asset server is already running.
    #[arg(long)]
    no_asset_server: bool,

    /// Skip the compute server's Compose project.
    #[arg(long)]
    no_main_server: bool,

    /// Write config.json with the effective settings and exit.
    #[arg(long)]
    init_config: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.config_dir {
        // SAFETY: no other threads exist yet; the runtime is built below.
        unsafe { std::env::set_var(ouroboros_lib::config::CONFIG_DIR_ENV, dir) };
    }

    let options = RunOptions {
        plugins_dir: args.plugins_dir,
        asset_server_port: args.asset_server_port,
        shell_api_port: args.shell_api_port,
        no_asset_server: args.no_asset_server,
        no_main_server: args.no_main_server,
    };

    if args.init_config {
        let mut config = ouroboros_lib::config::load_app_config();
        options.apply(&mut config);
        ouroboros_lib::config::save_app_config(&config).map_err(anyhow::Error::msg)?;
        println!(
            "{}",
            ouroboros_lib::config::config_dir().join("config.json").display()
        );
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(ouroboros_lib::run(options))
}
