#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;
use std::sync::Arc;

use relayd::config::{RuntimeConfig, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RuntimeConfig::load() {
        Ok(config) => config,
        Err(err) => {
            let code = err
                .downcast_ref::<StartupError>()
                .map(StartupError::exit_code)
                .unwrap_or(1);
            eprintln!("relayd: {err}");
            return ExitCode::from(code as u8);
        }
    };

    if let Some(level) = config.log_level.as_level() {
        if let Err(err) = simple_logger::init_with_level(level) {
            eprintln!("relayd: failed to initialize logger: {err}");
            return ExitCode::FAILURE;
        }
    }

    let config = Arc::new(config);
    if let Err(err) = relayd::run(config).await {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
