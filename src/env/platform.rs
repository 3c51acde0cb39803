// Purpose: Fixed environment facts for every platform crosspin can impersonate.
// Inputs/Outputs: Platform name -> Platform -> &'static PlatformFacts.
// Invariants: Profiles are immutable; one is selected per run.
// Gotchas: Values mirror what the stdlib `platform`/`os`/`sys` modules report on a real host,
//          so marker evaluation inside the resolver sees a coherent machine.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::env::version::InterpreterVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

pub const PLATFORM_NAMES: [&str; 3] = ["linux", "darwin", "windows"];

/// Nearest platform name within a small edit distance of `input`.
fn closest_name(input: &str) -> Option<&'static str> {
    let lowered = input.trim().to_ascii_lowercase();
    PLATFORM_NAMES
        .iter()
        .map(|name| (strsim::levenshtein(&lowered, name), *name))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, name)| name)
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Windows => "windows",
        }
    }

    /// The platform this binary was built for, if it is one we know.
    pub fn host() -> Option<Platform> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Darwin)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }

    pub fn facts(self) -> &'static PlatformFacts {
        match self {
            Platform::Linux => &LINUX,
            Platform::Darwin => &DARWIN,
            Platform::Windows => &WINDOWS,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "darwin" => Ok(Platform::Darwin),
            "windows" => Ok(Platform::Windows),
            _ => match closest_name(s) {
                Some(name) => bail!("unknown platform {:?}; did you mean `{}`?", s, name),
                None => bail!(
                    "unknown platform {:?}; expected one of: {}",
                    s,
                    PLATFORM_NAMES.join(", ")
                ),
            },
        }
    }
}

/// `platform.mac_ver()` as `(release, (version, dev_stage, non_release_version), machine)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacVer {
    pub release: &'static str,
    pub machine: &'static str,
}

impl MacVer {
    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!([self.release, ["", "", ""], self.machine])
    }
}

#[derive(Debug)]
pub struct PlatformFacts {
    pub os_name: &'static str,
    pub sys_platform: &'static str,
    pub platform_system: &'static str,
    pub machine: &'static str,
    pub release: &'static str,
    pub version: &'static str,
    pub mac_ver: Option<MacVer>,
    pub platform_tag: Option<&'static str>,
    /// `sys.version` with `{full}` standing in for the interpreter version.
    pub sys_version: &'static str,
}

impl PlatformFacts {
    pub fn sys_version_for(&self, version: &InterpreterVersion) -> String {
        self.sys_version.replace("{full}", &version.full())
    }
}

static LINUX: PlatformFacts = PlatformFacts {
    os_name: "posix",
    sys_platform: "linux",
    platform_system: "Linux",
    machine: "x86_64",
    release: "4.19.29-1-lts",
    version: "#1 SMP Thu Mar 14 15:39:08 CET 2019",
    mac_ver: None,
    platform_tag: None,
    sys_version: "{full} (default, Mar 26 2019, 21:43:19) \n[GCC 8.2.1 20181127]",
};

static DARWIN: PlatformFacts = PlatformFacts {
    os_name: "posix",
    sys_platform: "darwin",
    platform_system: "Darwin",
    machine: "x86_64",
    release: "18.2.0",
    version: "Darwin Kernel Version 18.2.0: Thu Dec 20 20:46:53 PST 2018; root:xnu-4903.241.1~1/RELEASE_X86_64",
    mac_ver: Some(MacVer {
        release: "10.14.2",
        machine: "x86_64",
    }),
    platform_tag: Some("macosx-10.14-x86_64"),
    sys_version: "{full} (v{full}:d7b1a6c, Dec 20 2018, 20:46:53) \n[Clang 6.0 (clang-600.0.57)]",
};

static WINDOWS: PlatformFacts = PlatformFacts {
    os_name: "nt",
    sys_platform: "win32",
    platform_system: "Windows",
    machine: "AMD64",
    release: "8",
    version: "6.2.9200",
    mac_ver: None,
    platform_tag: None,
    sys_version: "{full} (v{full}:bbf5c2d, Mar 25 2019, 22:22:05) [MSC v.1916 64 bit (AMD64)]",
};
