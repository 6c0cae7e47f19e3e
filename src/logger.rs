/// Initializes logging to a storage-scoped folder: `<storage_path>/logs`.
/// Creates the folder if missing and writes rolling log files. log4rs can
/// only be configured once per process; later engines reuse the first
/// configuration, so the error from a second init is ignored by callers.
pub fn init_for_storage(storage_path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::fs;
    let log_dir = storage_path.join("logs");
    fs::create_dir_all(&log_dir)?;
    let logfile = log_dir.join("chronolite.log");
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let file_appender = FileAppender::builder().encoder(encoder).build(logfile)?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
