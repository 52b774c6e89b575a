//! Logger construction. Every binary builds the same terminal drain stack
//! and passes the resulting [`Logger`] down through constructors.

use crate::config::LogLevel;
use slog::{o, Drain as _, LevelFilter, Logger};
use slog_async::Async;
use slog_term::{FullFormat, TermDecorator};

pub fn logger(level: LogLevel) -> Logger {
    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();
    let drain = LevelFilter::new(drain, level.as_slog_level()).fuse();
    Logger::root(drain, o!())
}
