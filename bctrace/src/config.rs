//! Per-session translator configuration.

use std::{env, error::Error};

/// The maximum number of locals a generator's creator can have for its locals to be copied into
/// the generator inline.
const DEFAULT_MAX_INLINE_CONT_LOCALS: u32 = 10;

#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    /// Emit `DbgAssertType` checks for facts the translator believes but does not guard.
    pub generate_asserts: bool,
    /// Emit statistics counters.
    pub stats: bool,
    /// Emit a grouped counter on every (inlined) function entry. Only has an effect if `stats` is
    /// set.
    pub stats_func_entry: bool,
    /// Objects may have destructors that run when they are freed, so they cannot be allocated
    /// with `AllocObjFast`.
    pub obj_destruct_call: bool,
    /// See [DEFAULT_MAX_INLINE_CONT_LOCALS].
    pub max_inline_cont_locals: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            generate_asserts: false,
            stats: false,
            stats_func_entry: false,
            obj_destruct_call: false,
            max_inline_cont_locals: DEFAULT_MAX_INLINE_CONT_LOCALS,
        }
    }
}

impl TranslatorConfig {
    /// Create a configuration from the `BCTRACE_*` environment variables, using defaults for
    /// those which are not set.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut cfg = Self::default();
        cfg.generate_asserts = env_flag("BCTRACE_GENERATE_ASSERTS")?.unwrap_or(false);
        cfg.stats = env_flag("BCTRACE_STATS")?.unwrap_or(false);
        cfg.stats_func_entry = env_flag("BCTRACE_STATS_FUNCENTRY")?.unwrap_or(false);
        cfg.obj_destruct_call = env_flag("BCTRACE_OBJ_DESTRUCT_CALL")?.unwrap_or(false);
        if let Ok(x) = env::var("BCTRACE_MAX_INLINE_CONT_LOCALS") {
            cfg.max_inline_cont_locals = x
                .parse::<u32>()
                .map_err(|e| format!("Invalid value for BCTRACE_MAX_INLINE_CONT_LOCALS: {e}"))?;
        }
        Ok(cfg)
    }
}

/// Read the boolean environment variable `name`, which must be `0` or `1` if set.
fn env_flag(name: &str) -> Result<Option<bool>, Box<dyn Error>> {
    match env::var(name) {
        Ok(x) => parse_flag(name, &x).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str, s: &str) -> Result<bool, Box<dyn Error>> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(format!("Invalid value for {name}: '{s}' (expected 0 or 1)").into()),
    }
}
