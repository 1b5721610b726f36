use clap::Parser;
use keep_node::cli::Cli;
use keep_node::config::ConfigFile;
use keep_node::tracing::init_logging;

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cores = ConfigFile::from_file(cli.config_path())
        .ok()
        .and_then(|config| config.cores);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(cores) = cores {
        builder.worker_threads(cores);
    }
    let runtime = builder.build()?;
    runtime.block_on(cli.run())
}
