use std::io::Write;

use env_logger::{Builder, Target};
use log::LevelFilter;

/// Resolves the log level: explicit `level`, then `RUST_LOG`, then info.
pub fn level_filter(level: Option<&str>) -> LevelFilter {
    level
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .or_else(|| {
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|v| v.parse::<LevelFilter>().ok())
        })
        .unwrap_or(LevelFilter::Info)
}

/// Installs the process logger on stderr. Calling it again is a no-op.
pub fn init(level: Option<&str>) {
    let result = Builder::new()
        .filter_level(level_filter(level))
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .try_init();
    if result.is_err() {
        log::debug!("logger already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_wins() {
        assert_eq!(level_filter(Some("debug")), LevelFilter::Debug);
        assert_eq!(level_filter(Some("WARN")), LevelFilter::Warn);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(Some("error"));
        init(Some("error"));
    }
}
