use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use pathwatcher::{Dispatch, PathWatchers, Watcher, WatcherBuilder};

use crate::logger::Logger;
use crate::{Args, Mode};

/// How often polled paths are checked
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn run(args: Args) -> Result<()> {
    let mut watcher = WatcherBuilder::default()
        .buffer_len(args.buffer_len)
        .build();
    watcher.init()?;

    if args.raw {
        run_raw(watcher, &args.paths)
    } else {
        run_paths(watcher, &args.paths, args.mode)
    }
}

/// Prints every native event, runs until all watched paths are gone
fn run_raw(mut watcher: Watcher, paths: &[PathBuf]) -> Result<()> {
    watcher.set_event_sink(|record| println!("{}", record));
    for path in paths {
        let handle = watcher
            .watch(path)
            .with_context(|| format!("Unable to watch {}", path.display()))?;
        println!("Watching {} [{}]", path.display(), handle);
    }

    while watcher.is_keep_alive() {
        watcher.process_next()?;
        Logger::global().drain_to_stderr();
    }
    Ok(())
}

fn run_paths(watcher: Watcher, paths: &[PathBuf], mode: Mode) -> Result<()> {
    let mut watchers = PathWatchers::new(watcher);
    watchers.set_mode(mode.into());
    for path in paths {
        let name = path.display().to_string();
        let id = watchers
            .watch(path, move |event| println!("{}: {}", name, event))
            .with_context(|| format!("Unable to watch {}", path.display()))?;
        println!("Watching {} {}", path.display(), id);
    }

    // deleted paths stop being watched
    while watchers.listener_count() > 0 {
        if watchers.is_polling() {
            while watchers.try_process_next()? != Dispatch::Idle {}
            watchers.tick();
            thread::sleep(POLL_INTERVAL);
        } else {
            watchers.process_next()?;
        }
        Logger::global().drain_to_stderr();
    }
    println!("Nothing left to watch");
    Ok(())
}
