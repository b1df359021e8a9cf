//! Process-wide `log` backend driven by [`LoggingConfig`], with an
//! env_logger fallback when the config has no `logging` section.

use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::Mutex;

type Writer = Mutex<BufWriter<Box<dyn Write + Send>>>;

struct Output {
    threshold: Option<LogLevel>,
    writer: Writer,
}

impl Output {
    fn open(target: &LogTarget) -> Result<Self, Box<dyn std::error::Error>> {
        let sink: Box<dyn Write + Send> = match target.output_type {
            LogOutputType::Stdout => Box::new(io::stdout()),
            LogOutputType::File => {
                let path = target
                    .path
                    .as_ref()
                    .ok_or("log target of type 'file' needs a path")?;
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };
        Ok(Self {
            threshold: target.level,
            writer: Mutex::new(BufWriter::new(sink)),
        })
    }

    fn accepts(&self, level: log::Level) -> bool {
        self.threshold.is_none_or(|min| LogLevel::from(level) >= min)
    }
}

pub struct CustomLogger {
    format: LogFormat,
    outputs: Vec<Output>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let outputs = config
            .targets
            .unwrap_or_default()
            .iter()
            .map(Output::open)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            format: config.format.unwrap_or_default(),
            outputs,
        })
    }

    /// Installs the logger globally. Fails if a logger is already set.
    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let max_level = LevelFilter::from(config.level.unwrap_or_default());
        log::set_boxed_logger(Box::new(Self::new(config)?))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn render(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format!(
                "{} [{}] [{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            ),
            LogFormat::Json => json_line(record),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.outputs.iter().any(|output| output.accepts(metadata.level()))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.render(record);
        for output in self.outputs.iter().filter(|o| o.accepts(record.level())) {
            if let Ok(mut writer) = output.writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for output in &self.outputs {
            if let Ok(mut writer) = output.writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

fn json_line(record: &Record) -> String {
    json!({
        "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().as_str().to_ascii_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "message": record.args().to_string(),
    })
    .to_string()
}

/// env_logger with `RUST_LOG` taking precedence over `level`.
pub fn init_fallback(level: LogLevel, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let default_filter = LevelFilter::from(level).to_string().to_ascii_lowercase();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;
    Ok(())
}
