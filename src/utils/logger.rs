use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Install the process logger at `level`.
///
/// Output goes to stderr so the interactive client prompt on stdout stays
/// readable. `RUST_LOG` still refines the filter per module.
pub fn setup_logging(level: LevelFilter) {
    let mut builder = Builder::new();

    builder
        .target(Target::Stderr)
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        });

    // A second call (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
}
