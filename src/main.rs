use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tunnelscope::ProxyConfig;

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.debug);

    match tunnelscope::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
