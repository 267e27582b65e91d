use std::process::ExitCode;
use std::sync::Arc;

use log::*;

use ip_server::config::Config;
use ip_server::notifier::Notifier;
use ip_server::resolver::ExternalIpResolver;
use ip_server::server::{self, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let (notifier, resolver) = match (
        Notifier::new(config.notifier.clone()),
        ExternalIpResolver::new(),
    ) {
        (Ok(notifier), Ok(resolver)) => (notifier, resolver),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to build http client: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server::run(&config, Arc::new(resolver), notifier, shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server stopped with error: {e}");
            ExitCode::FAILURE
        }
    }
}
