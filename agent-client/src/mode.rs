//! The operating mode passed to the remote agent on the command line.

use std::fmt;
use std::str::FromStr;

/// Which mode the remote agent process should run in.
///
/// This is opaque to the messaging engine; it's only used to build the `-m` flag passed to the
/// remote agent binary when the child is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Compile,
    Run,
}

impl Mode {
    /// The flag value passed after `-m` on the remote agent's command line.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Mode::Compile => "compile",
            Mode::Run => "run",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(Mode::Compile),
            "run" => Ok(Mode::Run),
            other => Err(format!("unknown mode '{}', expected compile|run", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_from_str() {
        for mode in [Mode::Compile, Mode::Run] {
            let parsed: Mode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!("debug".parse::<Mode>().is_err());
    }
}
