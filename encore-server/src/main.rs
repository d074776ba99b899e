use colored::Colorize;
use encore_server::{logging, run_server, Config, EncoreError};
use log::error;
use tokio::runtime;

fn main() {
    logging::init_logger();

    if let Err(error) = start() {
        error!(
            "{} Read the error below to troubleshoot the issue.",
            "Encore failed to start!".bold().red()
        );
        error!("{}", error);
        error!(
            "{}",
            format!("Hint: {}", error.hint()).bright_black().italic()
        );
    }
}

fn start() -> Result<(), EncoreError> {
    let config = Config::from_env()?;

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("encore-async")
        .build()
        .map_err(|e| EncoreError::Fatal(e.to_string()))?;

    runtime.block_on(run_server(config))
}
