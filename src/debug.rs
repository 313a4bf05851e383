//! Logging backend for kexboot.
//!
//! Library code logs through the [`log`] facade. [`init`] installs a stderr
//! logger whose verbosity is controlled by the `KEXBOOT_DEBUG` environment
//! variable:
//! - `KEXBOOT_DEBUG=1` - Enable all debug output
//! - `KEXBOOT_DEBUG=aio` - Enable only file-loading logs
//! - `KEXBOOT_DEBUG=kexec,boot` - Enable multiple categories
//!
//! Without the variable only warnings and errors are printed.

use std::io::Write;
use std::sync::OnceLock;

use log::{Level, LevelFilter, Metadata, Record};

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Aio,
    Kexec,
    Boot,
    Mount,
}

impl DebugCategory {
    const ALL: [DebugCategory; 4] = [
        DebugCategory::Aio,
        DebugCategory::Kexec,
        DebugCategory::Boot,
        DebugCategory::Mount,
    ];

    fn name(self) -> &'static str {
        match self {
            DebugCategory::Aio => "aio",
            DebugCategory::Kexec => "kexec",
            DebugCategory::Boot => "boot",
            DebugCategory::Mount => "mount",
        }
    }

    /// Category owning a log target such as `kexboot::aio::kernel`.
    fn of_target(target: &str) -> Option<Self> {
        let module = target.strip_prefix("kexboot::")?;
        let head = match module.split("::").next()? {
            "memory" => "kexec",
            "bootloader" | "builder" | "config" => "boot",
            head => head,
        };
        Self::ALL.into_iter().find(|c| c.name() == head)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DebugConfig {
    enabled: Vec<DebugCategory>,
}

impl DebugConfig {
    fn parse(val: &str) -> Self {
        let val = val.trim().to_lowercase();
        if val == "1" || val == "all" {
            return Self {
                enabled: DebugCategory::ALL.to_vec(),
            };
        }
        Self {
            enabled: DebugCategory::ALL
                .into_iter()
                .filter(|c| val.split(',').any(|part| part.trim() == c.name()))
                .collect(),
        }
    }

    fn from_env() -> Self {
        match std::env::var("KEXBOOT_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }

    fn allows(&self, target: &str, level: Level) -> bool {
        if level <= Level::Warn {
            return true;
        }
        if level > Level::Debug {
            return false;
        }
        match DebugCategory::of_target(target) {
            Some(category) => self.enabled.contains(&category),
            // Messages from the binary follow the broadest setting.
            None => self.enabled.len() == DebugCategory::ALL.len(),
        }
    }
}

struct StderrLogger {
    config: DebugConfig,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.config.allows(metadata.target(), metadata.level())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Install the stderr logger. Calling this more than once is harmless.
pub fn init() {
    let logger = LOGGER.get_or_init(|| StderrLogger {
        config: DebugConfig::from_env(),
    });
    if log::set_logger(logger).is_ok() {
        let max = if logger.config.enabled.is_empty() {
            LevelFilter::Warn
        } else {
            LevelFilter::Debug
        };
        log::set_max_level(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all() {
        assert_eq!(DebugConfig::parse("1").enabled.len(), 4);
        assert_eq!(DebugConfig::parse("ALL").enabled.len(), 4);
    }

    #[test]
    fn test_parse_list() {
        let config = DebugConfig::parse("aio, mount");
        assert_eq!(config.enabled, vec![DebugCategory::Aio, DebugCategory::Mount]);
    }

    #[test]
    fn test_category_filtering() {
        let config = DebugConfig::parse("kexec");
        assert!(config.allows("kexboot::kexec::controller", Level::Debug));
        assert!(!config.allows("kexboot::aio", Level::Debug));
        assert!(config.allows("kexboot::aio", Level::Warn));
        assert!(!config.allows("kexboot::kexec", Level::Trace));
        assert!(!config.allows("kexboot", Level::Info));
    }

    #[test]
    fn test_unknown_target_has_no_category() {
        assert_eq!(DebugCategory::of_target("other::aio"), None);
        assert_eq!(DebugCategory::of_target("kexboot::boot::linux"), Some(DebugCategory::Boot));
        assert_eq!(DebugCategory::of_target("kexboot::memory"), Some(DebugCategory::Kexec));
    }
}
