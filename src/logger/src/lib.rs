pub use log::*;

use once_cell::sync::OnceCell;

static LOGGER: Logger = Logger;
static INSTALLED: OnceCell<()> = OnceCell::new();

// init installs the stderr logger once per process. Later calls only adjust
// the maximum level, so every test may call it.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    if INSTALLED.get().is_some() {
        set_max_level(level);
        return Ok(());
    }
    set_logger(&LOGGER).map(|()| {
        let _ = INSTALLED.set(());
        set_max_level(level)
    })
}

pub fn init_for_test() {
    let _ = init(LevelFilter::Trace);
}

#[derive(Copy, Clone)]
struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }
    fn flush(&self) {}
}
