//! CLI / environment configuration surface.
//!
//! Exposes the loader's flag set (library search path, log level, log
//! destination, debugger/DSU toggles, namespace ceiling) through `clap`'s
//! derive API rather than a hand-rolled argument parser.

use clap::Parser;
use std::path::PathBuf;

/// Log severity ladder, from silent to fully verbose tracing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    None,
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::None => log::LevelFilter::Off,
            LogLevel::Fatal | LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Verbose | LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "luci", about = "Dynamic Software Updating capable ELF loader")]
pub struct Args {
    /// Additional directories to search for shared objects, colon-separated.
    #[arg(long = "library-path", value_delimiter = ':')]
    pub library_path: Vec<PathBuf>,

    /// Log severity filter.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Warning)]
    pub log_level: LogLevel,

    /// Log destination; absent means stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Truncate the log file on open (default: append).
    #[arg(long = "log-truncate", conflicts_with = "log_append")]
    pub log_truncate: bool,

    /// Append to the log file on open (default).
    #[arg(long = "log-append")]
    pub log_append: bool,

    /// Enable GDB debug-notifier support.
    #[arg(long = "debugger", default_value_t = true, action = clap::ArgAction::Set)]
    pub debugger: bool,

    /// Enable the DSU filesystem watcher.
    #[arg(long = "watch", default_value_t = true, action = clap::ArgAction::Set)]
    pub watch: bool,

    /// Maximum number of dynamic namespaces (beyond the default one).
    #[arg(long = "namespace-limit", default_value_t = 16)]
    pub namespace_limit: usize,

    /// Target program and its argv, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub target: Vec<String>,
}

/// Environment variable names mirrored by the CLI, consumed (and erased) once read.
pub mod env_vars {
    pub const LOG_LEVEL: &str = "LUCI_LOG_LEVEL";
    pub const LOG_FILE: &str = "LUCI_LOG_FILE";
    pub const LIBRARY_PATH: &str = "LUCI_LIBRARY_PATH";
    pub const SECURE: &str = "LUCI_SECURE";
}

impl Args {
    /// Overlay values taken from the mirrored environment variables, erasing
    /// each one from the process environment once consumed. CLI flags that
    /// were explicitly given take precedence over the environment.
    pub fn apply_environment(&mut self) {
        if let Ok(val) = std::env::var(env_vars::LOG_FILE) {
            if self.log_file.is_none() {
                self.log_file = Some(PathBuf::from(val));
            }
            std::env::remove_var(env_vars::LOG_FILE);
        }
        if let Ok(val) = std::env::var(env_vars::LOG_LEVEL) {
            if let Some(level) = parse_log_level(&val) {
                self.log_level = level;
            }
            std::env::remove_var(env_vars::LOG_LEVEL);
        }
        if self.secure() {
            // Security mode: user-supplied search paths (CLI or environment) are ignored.
            self.library_path.clear();
        } else if let Ok(val) = std::env::var(env_vars::LIBRARY_PATH) {
            self.library_path
                .extend(val.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
            std::env::remove_var(env_vars::LIBRARY_PATH);
        }
        if std::env::var_os(env_vars::SECURE).is_some() {
            std::env::remove_var(env_vars::SECURE);
        }
    }

    /// Whether the security flag (disabling user-supplied search paths) is present.
    pub fn secure(&self) -> bool {
        std::env::var_os(env_vars::SECURE).is_some()
    }

    pub fn truncate_log(&self) -> bool {
        self.log_truncate && !self.log_append
    }
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
    match s.to_ascii_uppercase().as_str() {
        "NONE" => Some(LogLevel::None),
        "FATAL" => Some(LogLevel::Fatal),
        "ERROR" => Some(LogLevel::Error),
        "WARNING" => Some(LogLevel::Warning),
        "INFO" => Some(LogLevel::Info),
        "VERBOSE" => Some(LogLevel::Verbose),
        "DEBUG" => Some(LogLevel::Debug),
        "TRACE" => Some(LogLevel::Trace),
        _ => None,
    }
}

/// Installs `env_logger` with the severity and destination chosen by `Args`.
pub fn init_logging(args: &Args) -> crate::errors::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(args.log_level.to_filter());
    if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(!args.truncate_log())
            .truncate(args.truncate_log())
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    // Ignore "already initialized" so tests can call this repeatedly.
    let _ = builder.try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_library_path_list() {
        let args = Args::parse_from(["luci", "--library-path", "/a:/b:/c", "--", "prog"]);
        assert_eq!(
            args.library_path,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert_eq!(args.target, vec!["prog".to_string()]);
    }

    #[test]
    fn default_log_level_is_warning() {
        let args = Args::parse_from(["luci", "--", "prog"]);
        assert_eq!(args.log_level, LogLevel::Warning);
    }

    #[test]
    fn log_level_maps_to_filter() {
        assert_eq!(LogLevel::None.to_filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Trace.to_filter(), log::LevelFilter::Trace);
        assert_eq!(LogLevel::Verbose.to_filter(), log::LevelFilter::Debug);
    }
}
