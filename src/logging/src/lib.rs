use log::info;

/// Installs the process-wide logger. Every node binary calls this first.
///
/// The filter comes from `RUST_LOG` and defaults to `debug`.
pub fn init_log() {
    use chrono::Utc;
    use std::io::Write;

    let env = env_logger::Env::default().default_filter_or("debug");
    let res = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                level_style.value(record.level()),
                record.file().unwrap_or("<unnamed>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .try_init();

    // tests in one binary share the logger, only the first call wins
    if res.is_ok() {
        info!("env_logger initialized");
    }
}
