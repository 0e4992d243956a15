//! Logging setup, adapted from `src-tauri/src/log.rs`'s desktop dual
//! backend/frontend split into a single-process server log: one terminal
//! sink plus one rotating-by-run file sink under the state directory.

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::Path;

pub fn setup_logger(state_dir: &Path, quiet: bool) -> Result<()> {
    let log_dir = state_dir.join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    let log_file =
        File::create(log_dir.join("connect.log")).context("failed to create connect.log")?;

    let file_config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|b| b)
        .build();

    let term_level = if quiet { LevelFilter::Warn } else { LevelFilter::Info };
    let term_config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|b| b)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        term_level,
        term_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    loggers.push(WriteLogger::new(LevelFilter::Debug, file_config, log_file));

    CombinedLogger::init(loggers).ok();
    log::info!("connect-server logging initialized, writing to {:?}", log_dir);
    Ok(())
}
