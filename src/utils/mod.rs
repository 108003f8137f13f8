// Utility functions for the DRM Testbed

use std::path::Path;
use std::process::Command;

/// Terminal logging for the binary
pub mod logging {
    use std::io::{self, Write};

    use crossterm::style::{Color, Stylize};
    use crossterm::tty::IsTty;
    use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

    /// `log` backend writing timestamped, level-tagged lines to stderr
    pub struct TermLogger {
        level: LevelFilter,
        color: bool, // Only when stderr is a terminal
    }

    impl TermLogger {
        pub fn new(level: LevelFilter) -> Self {
            Self {
                level,
                color: io::stderr().is_tty(),
            }
        }

        fn tag(&self, level: Level) -> String {
            let (text, color) = match level {
                Level::Error => ("ERROR", Color::Red),
                Level::Warn => ("WARNING", Color::Yellow),
                Level::Info => ("INFO", Color::Green),
                Level::Debug => ("DEBUG", Color::Cyan),
                Level::Trace => ("TRACE", Color::DarkGrey),
            };
            if self.color {
                text.with(color).bold().to_string()
            } else {
                text.to_string()
            }
        }
    }

    impl Log for TermLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let mut stderr = io::stderr().lock();
            let _ = writeln!(stderr, "{} {}: {}", timestamp, self.tag(record.level()), record.args());
        }

        fn flush(&self) {
            let _ = io::stderr().flush();
        }
    }

    /// Installs the terminal logger as the global `log` backend
    pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(TermLogger::new(level)))?;
        log::set_max_level(level);
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn plain_tags_without_a_terminal() {
            let logger = TermLogger { level: LevelFilter::Info, color: false };
            assert_eq!(logger.tag(Level::Warn), "WARNING");
            assert!(logger.enabled(&Metadata::builder().level(Level::Info).build()));
            assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).build()));
        }

        #[test]
        fn init_installs_the_global_logger_once() {
            init(LevelFilter::Debug).unwrap();
            assert_eq!(log::max_level(), LevelFilter::Debug);
            assert!(init(LevelFilter::Info).is_err());
        }
    }
}

/// Runs `program` with `args` and returns its trimmed stdout
pub fn run_command_args(program: &Path, args: &[&str]) -> Result<String, String> {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(format!("Command failed: {}", stderr))
            }
        }
        Err(e) => Err(format!("Failed to execute {}: {}", program.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_reports_its_path() {
        let err = run_command_args(Path::new("/nonexistent/modprobe"), &["-s", "vgem"]).unwrap_err();
        assert!(err.contains("/nonexistent/modprobe"));
    }
}
