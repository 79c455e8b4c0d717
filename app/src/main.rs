use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use pathwatcher::{WatchMode, DEFAULT_BUFFER_LEN};

use crate::logger::Logger;

mod logger;
mod watch;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Files or directories to watch
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Print native events as they are received instead of per path changes
    #[arg(long)]
    raw: bool,

    /// How paths are watched when per path changes are printed
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,

    /// Size (in bytes) of buffer for native notifications
    #[arg(long, default_value_t = DEFAULT_BUFFER_LEN)]
    buffer_len: usize,

    /// Print debug messages of watcher
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Native watches, polling once native watch limit is reached
    Auto,
    /// Native watches only
    Watch,
    /// Poll modification time of every path
    Poll,
}

impl From<Mode> for WatchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => WatchMode::Auto,
            Mode::Watch => WatchMode::Watch,
            Mode::Poll => WatchMode::Poll,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    Logger::install(level)?;

    let result = watch::run(args);
    Logger::global().drain_to_stderr();
    result
}
