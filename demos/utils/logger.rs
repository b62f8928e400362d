use log::{Level, LevelFilter, Log, Metadata, Record};

/// Prints records to stderr as `[LEVEL target] message`.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger. The level comes from `NETSTACK_LOG` (`error` through
/// `trace`) and defaults to `info`.
pub fn init_logger() {
    let level = std::env::var("NETSTACK_LOG")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .map(|level| level.to_level_filter())
        .unwrap_or(LevelFilter::Info);

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
