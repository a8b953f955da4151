use config_helpers_farm::logging::init_logging;
use farm_pool::FarmPool;
use tracing::error;

use crate::args::process_cli_args;

mod args;

#[tokio::main]
async fn main() {
    let config = process_cli_args().unwrap_or_else(|e| {
        eprintln!("Farm pool config error: {e}");
        std::process::exit(1);
    });

    init_logging(config.log_file());
    if let Err(e) = FarmPool::new(config).start().await {
        error!("Farm pool failed: {}", e);
        std::process::exit(1);
    }
}
