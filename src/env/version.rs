// Purpose: Model interpreter versions and overlay user-supplied dotted versions on the real one.
// Inputs/Outputs: Dotted strings + probed host version -> immutable InterpreterVersion.
// Invariants: Unspecified trailing components come from the real interpreter, never zero.
// Gotchas: Non-numeric segments are dropped before overlaying, so "3.x.8" means 3.8.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseLevel {
    Alpha,
    Beta,
    Candidate,
    Final,
}

impl ReleaseLevel {
    fn short_tag(self) -> Option<&'static str> {
        match self {
            ReleaseLevel::Alpha => Some("a"),
            ReleaseLevel::Beta => Some("b"),
            ReleaseLevel::Candidate => Some("rc"),
            ReleaseLevel::Final => None,
        }
    }
}

/// Structured interpreter version, shaped like Python's `sys.version_info`.
///
/// Field order matches the tuple order, so the derived `Ord` compares
/// versions the way the interpreter itself does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(
    from = "(u32, u32, u32, ReleaseLevel, u32)",
    into = "(u32, u32, u32, ReleaseLevel, u32)"
)]
pub struct InterpreterVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub release_level: ReleaseLevel,
    pub serial: u32,
}

impl From<(u32, u32, u32, ReleaseLevel, u32)> for InterpreterVersion {
    fn from(t: (u32, u32, u32, ReleaseLevel, u32)) -> Self {
        Self {
            major: t.0,
            minor: t.1,
            micro: t.2,
            release_level: t.3,
            serial: t.4,
        }
    }
}

impl From<InterpreterVersion> for (u32, u32, u32, ReleaseLevel, u32) {
    fn from(v: InterpreterVersion) -> Self {
        (v.major, v.minor, v.micro, v.release_level, v.serial)
    }
}

impl InterpreterVersion {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            release_level: ReleaseLevel::Final,
            serial: 0,
        }
    }

    /// Overlay the numeric segments of `requested` onto `real`, left to right.
    ///
    /// Only the numeric slots (major, minor, micro) can be overlaid; extra
    /// segments past micro are ignored and the release level and serial always
    /// stay the real interpreter's. Never fails.
    pub fn overlay(requested: &str, real: &InterpreterVersion) -> Self {
        let mut out = *real;
        let numeric = requested
            .trim()
            .split('.')
            .filter(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|seg| seg.parse::<u32>().ok());
        for (idx, value) in numeric.enumerate() {
            match idx {
                0 => out.major = value,
                1 => out.minor = value,
                2 => out.micro = value,
                _ => break,
            }
        }
        out
    }

    /// `M.m`, the form used by `python_version` markers and cache names.
    pub fn short(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// `M.m.u` plus a pre-release suffix, the form of `python_full_version`.
    pub fn full(&self) -> String {
        let mut out = format!("{}.{}.{}", self.major, self.minor, self.micro);
        if let Some(tag) = self.release_level.short_tag() {
            out.push_str(tag);
            out.push_str(&self.serial.to_string());
        }
        out
    }

    pub fn major_minor(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}
