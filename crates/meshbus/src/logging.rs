// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Console logger behind the `log` facade.
//!
//! The crate logs through `log::debug!`/`log::info!`/`log::warn!`
//! everywhere; this module provides the minimal sink the runtime
//! installs when verbose mode is on. Installation happens at most once
//! per process; later calls (including from a second runtime) are
//! no-ops.

use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;

static LOGGER: OnceLock<ConsoleLogger> = OnceLock::new();

/// Plain stderr logger with a level prefix.
struct ConsoleLogger {
    max_level: Level,
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console logger, if no logger is installed yet.
///
/// `verbose` selects Debug level, otherwise Warn. Safe to call from
/// multiple runtimes; only the first call takes effect.
pub fn init(verbose: bool) {
    let level = if verbose { Level::Debug } else { Level::Warn };
    let logger = LOGGER.get_or_init(|| ConsoleLogger { max_level: level });
    // set_logger fails if another logger (e.g. the application's own)
    // is already installed; that is fine, theirs wins.
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
