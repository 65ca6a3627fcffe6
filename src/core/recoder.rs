use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};

pub fn build_log_config(learner: &crate::core::parser::Learner) -> anyhow::Result<log4rs::Config> {
    let level = log::LevelFilter::Info;
    let mut log_path = learner.run_dir();
    if !log_path.exists() {
        std::fs::create_dir_all(&log_path)?;
    }

    log_path.push(chrono::Local::now().format("%Y%m-%d--%H-%M-%S").to_string() + ".log");

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l})} {m}{n}")))
        .build();

    // Pattern: https://docs.rs/log4rs/*/log4rs/encode/pattern/index.html
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%+)(utc)} [{f}:{L}] {h({l})} -> {m}{n}",
        )))
        .build(log_path)?;

    // Everything down to trace goes to the file, stderr only sees `level`.
    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(stderr)),
        )
        .build(
            Root::builder()
                .appender("logfile")
                .appender("stderr")
                .build(log::LevelFilter::Trace),
        )?;

    Ok(config)
}
