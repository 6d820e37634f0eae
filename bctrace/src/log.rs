//! The implementation of the `BCTRACE_LOG` and `BCTRACE_LOG_IR` environment variables.

use std::{
    collections::HashSet,
    env,
    error::Error,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use strum::{EnumCount, FromRepr};

/// How verbose should the translator's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log translation events (e.g. an instruction handed to the interpreter).
    Translation,
    /// Log the start and end of inlined frames.
    Inlining,
}

#[derive(Debug)]
pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("BCTRACE_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split_once(':') {
            Some((_, level)) if level.contains(':') => {
                return Err("BCTRACE_LOG must be of the format `[<path|->:]<level>`".into());
            }
            Some(("-", level)) => (None, level),
            Some((path, level)) => {
                let path = PathBuf::from(path);
                // Truncate any log left over from a previous run.
                File::create(&path).ok();
                (Some(path), level)
            }
            None => (None, s),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid BCTRACE_LOG level '{s}': {e}"))?;
        // This unwrap can only fail if `Verbosity` has more than 256 variants.
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("BCTRACE_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// A [Log] which logs nothing.
    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            path: None,
            level: Verbosity::Disabled,
        }
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!("can't log at level Disabled"),
                Verbosity::Error => "bctrace-error",
                Verbosity::Warning => "bctrace-warning",
                Verbosity::Translation => "bctrace-translation",
                Verbosity::Inlining => "bctrace-inlining",
            };
            match &self.path {
                Some(p) => append(p, &format!("{prefix}: {msg}\n")),
                None => eprintln!("{prefix}: {msg}"),
            }
        }
    }
}

/// Append `s` to the file at `path`. Logging failures are ignored.
fn append(path: impl AsRef<Path>, s: &str) {
    if let Ok(mut f) = File::options().append(true).open(path) {
        f.write_all(s.as_bytes()).ok();
    }
}

#[derive(Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// Each bytecode instruction as it is translated.
    Bytecode,
    /// The HIR of a finished translation.
    HIR,
}

impl IRPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "bytecode" => Ok(Self::Bytecode),
            "hir" => Ok(Self::HIR),
            _ => Err(format!("Invalid BCTRACE_LOG_IR value: {s}").into()),
        }
    }
}

/// The output path (`-` for stderr) and phases requested by `BCTRACE_LOG_IR`.
static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
    let var = env::var("BCTRACE_LOG_IR").ok()?;
    let (path, phases) = match var.split_once(':') {
        Some((path, phases)) => (path, phases),
        None => ("-", var.as_str()),
    };
    let phases = phases
        .split(',')
        .map(IRPhase::from_str)
        .collect::<Result<HashSet<_>, _>>()
        .unwrap_or_else(|e| panic!("{e}"));
    if path != "-" {
        File::create(path).ok();
    }
    Some((path.to_owned(), phases))
});

/// Has `BCTRACE_LOG_IR` asked for `phase` to be logged?
pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
    LOG_IR
        .as_ref()
        .is_some_and(|(_, phases)| phases.contains(&phase))
}

pub(crate) fn log_ir(s: &str) {
    match LOG_IR.as_ref() {
        Some((p, _)) if p == "-" => eprint!("{s}"),
        Some((p, _)) => append(p, s),
        None => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        let l = Log::parse("-:3").unwrap();
        assert_eq!(l.level, Verbosity::Translation);
        assert!(l.path.is_none());
        let l = Log::parse("4").unwrap();
        assert_eq!(l.level, Verbosity::Inlining);
        assert!(Log::parse("5").is_err());
        assert!(Log::parse("x").is_err());
        assert!(Log::parse("a:b:c").is_err());
    }

    #[test]
    fn ir_phases() {
        assert!(IRPhase::from_str("hir").is_ok());
        assert!(IRPhase::from_str("bytecode").is_ok());
        assert!(IRPhase::from_str("jit-asm").is_err());
    }
}
