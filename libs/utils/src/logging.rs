use std::str::FromStr;

use anyhow::Context;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LogFormat {
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unknown log format: '{s}', expected one of 'plain' or 'json'"),
        }
    }
}

/// Initialize the process-wide tracing subscriber.
///
/// The filter defaults to `info` and can be overridden through the
/// conventional `RUST_LOG` environment variable.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let default_filter_str = "info";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout);

    match log_format {
        LogFormat::Json => base_logger.json().init(),
        LogFormat::Plain => base_logger.init(),
    }

    Ok(())
}

/// Replace the default panic hook with one that routes the panic message
/// through tracing before the process keels over, so it ends up in the same
/// sink as everything else.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let location = info.location();
    let payload = info.payload();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<unknown panic payload>"
    };

    match location {
        Some(loc) => tracing::error!(
            panic.file = loc.file(),
            panic.line = loc.line(),
            "panic: {message}"
        ),
        None => tracing::error!("panic: {message}"),
    }
}

/// Parse the log format CLI/env value, used by binary entry points.
pub fn parse_log_format(value: &str) -> anyhow::Result<LogFormat> {
    LogFormat::from_str(value).context("parsing log format")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_str() {
        assert_eq!(LogFormat::from_str("plain").unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("yaml").is_err());
    }
}
