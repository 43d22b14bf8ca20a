//! ANSI color policy for log output.
//!
//! Resolution order:
//! - An explicit `--color always|never` wins.
//! - In `auto`, `NO_COLOR` or `EMACS` turn colors off.
//! - Otherwise colors follow whether the stream is a terminal.

use std::env;

/// When the log writer emits ANSI colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ColorWhen {
    /// Color only when the stream is a terminal
    #[default]
    Auto,

    /// Always color
    Always,

    /// Never color
    Never,
}

impl ColorWhen {
    // ---
    /// Resolves the policy against `stream` and the environment.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables_color() && atty::is(stream),
        }
    }

    /// Logs are written to stderr, so that is the stream that matters.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_disables_color() -> bool {
    // ---
    env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_explicit_choices_ignore_environment() {
        // ---
        assert!(ColorWhen::Always.should_color_stderr());
        assert!(!ColorWhen::Never.should_color_stderr());
    }

    #[test]
    fn test_parses_from_flag_values() {
        // ---
        assert_eq!(ColorWhen::from_str("auto", true), Ok(ColorWhen::Auto));
        assert_eq!(ColorWhen::from_str("ALWAYS", true), Ok(ColorWhen::Always));
        assert_eq!(ColorWhen::from_str("never", false), Ok(ColorWhen::Never));
        assert!(ColorWhen::from_str("sometimes", true).is_err());
    }

    #[test]
    fn test_default_is_auto() {
        // ---
        assert_eq!(ColorWhen::default(), ColorWhen::Auto);
    }
}
