// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Runtime configuration sourced from environment variables.
//!
//! Quill has no config file and no CLI flags beyond the script path;
//! knobs that exist purely to make the collector and VM testable
//! (stress mode, GC tracing, capacity limits) are read from the
//! environment once at startup instead.

/// Default operand stack capacity, matching clox's `STACK_MAX`.
pub const DEFAULT_STACK_MAX: usize = 16384;

/// Default call-frame depth limit, matching clox's `FRAMES_MAX`.
pub const DEFAULT_FRAMES_MAX: usize = 64;

/// Policy knobs for the garbage collector.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcConfig {
    /// Collect before every single allocation rather than only once the
    /// heap has grown past its threshold. Set via `QUILL_GC_STRESS=1`.
    /// Slow, but turns rare use-after-free/missing-root bugs into
    /// reliably reproducible ones.
    pub stress: bool,
    /// Raise GC-cycle tracing from `trace!` to `info!`. Set via
    /// `QUILL_GC_LOG=1`.
    pub log_info: bool,
}

impl GcConfig {
    /// Read collector policy from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            stress: env_flag("QUILL_GC_STRESS"),
            log_info: env_flag("QUILL_GC_LOG"),
        }
    }
}

/// Interpreter-wide limits.
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub stack_max: usize,
    pub frames_max: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_max: DEFAULT_STACK_MAX,
            frames_max: DEFAULT_FRAMES_MAX,
        }
    }
}

impl VmConfig {
    /// Read interpreter limits from the process environment, falling
    /// back to the compiled-in defaults for anything unset or
    /// unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stack_max: env_usize("QUILL_STACK_MAX").unwrap_or(defaults.stack_max),
            frames_max: env_usize("QUILL_FRAMES_MAX").unwrap_or(defaults.frames_max),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v != "0" && !v.is_empty())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_clox_limits() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.stack_max, 16384);
        assert_eq!(cfg.frames_max, 64);
    }

    #[test]
    fn gc_config_defaults_to_non_stress() {
        assert!(!GcConfig::default().stress);
    }
}
