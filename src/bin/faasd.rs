use clap::Parser;
use faasd_control_plane::cli::{self, Cli};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}
