// Purpose: Probe the real interpreter for the environment facts the resolver would observe.
// Inputs/Outputs: Runs `<python> -c <probe>` and decodes one JSON object into HostFacts.
// Invariants: Host facts are read once per run and never mutated afterwards.
// Gotchas: The probe must only use stdlib modules; it runs before any resolver is installed.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::process::Command;

use crate::env::platform::Platform;
use crate::env::version::InterpreterVersion;

/// Newest interpreter the bundled platform profiles were checked against.
pub const NEWEST_TESTED: (u32, u32) = (3, 10);

const PROBE: &str = r#"import json, os, platform, sys, sysconfig
print(json.dumps({
    "version_info": list(sys.version_info[:5]),
    "os_name": os.name,
    "sys_platform": sys.platform,
    "platform_system": platform.system(),
    "machine": platform.machine(),
    "release": platform.release(),
    "version": platform.version(),
    "mac_ver": platform.mac_ver(),
    "platform_tag": sysconfig.get_platform(),
    "sys_version": sys.version,
}))"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub version_info: InterpreterVersion,
    pub os_name: String,
    pub sys_platform: String,
    pub platform_system: String,
    pub machine: String,
    pub release: String,
    pub version: String,
    pub mac_ver: (String, (String, String, String), String),
    pub platform_tag: String,
    pub sys_version: String,
}

impl HostFacts {
    pub fn probe(python: &str) -> anyhow::Result<Self> {
        let out = Command::new(python)
            .args(["-c", PROBE])
            .output()
            .with_context(|| format!("failed to execute {}", python))?;
        if !out.status.success() {
            bail!(
                "{} failed to report host facts: {}",
                python,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Self::from_probe_output(&String::from_utf8_lossy(&out.stdout))
            .with_context(|| format!("decode host facts reported by {}", python))
    }

    pub fn from_probe_output(stdout: &str) -> anyhow::Result<Self> {
        let line = stdout
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .context("probe printed no JSON object")?;
        Ok(serde_json::from_str(line)?)
    }

    pub fn mac_ver_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.mac_ver).unwrap_or(serde_json::Value::Null)
    }

    /// Combinations that are known to produce unreliable pins. Never fatal.
    pub fn support_warnings(&self, target: &InterpreterVersion) -> Vec<String> {
        self.support_warnings_on(Platform::host(), target)
    }

    pub fn support_warnings_on(
        &self,
        host: Option<Platform>,
        target: &InterpreterVersion,
    ) -> Vec<String> {
        let mut out = vec![];
        match host {
            Some(Platform::Linux) => {}
            Some(p) => out.push(format!(
                "running on {} is not supported; only linux hosts produce reliable pins",
                p
            )),
            None => out.push("running on an unrecognized host platform".to_string()),
        }
        for (what, v) in [("host", &self.version_info), ("target", target)] {
            if v.major_minor() > NEWEST_TESTED {
                out.push(format!(
                    "{} interpreter {} is newer than the newest tested {}.{}",
                    what,
                    v.short(),
                    NEWEST_TESTED.0,
                    NEWEST_TESTED.1
                ));
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn sample_host() -> HostFacts {
    HostFacts {
        version_info: InterpreterVersion::new(3, 9, 7),
        os_name: "host-os".to_string(),
        sys_platform: "host-platform".to_string(),
        platform_system: "HostSystem".to_string(),
        machine: "host-machine".to_string(),
        release: "host-release".to_string(),
        version: "host-version".to_string(),
        mac_ver: (
            String::new(),
            (String::new(), String::new(), String::new()),
            String::new(),
        ),
        platform_tag: "host-tag".to_string(),
        sys_version: "3.9.7 (host build)".to_string(),
    }
}
