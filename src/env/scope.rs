// Purpose: Impersonate a target platform/interpreter for the duration of one resolution.
// Inputs/Outputs: (version string, platform) -> ordered mocks -> ActiveScope guard over a FactEnvironment.
// Invariants: Every installed mock is removed when the guard drops, including on early return
//             and panic unwind. Platform identity mocks are skipped for the host's own platform.
// Gotchas: No two mocks target the same fact, so activation order is irrelevant.

use std::ops::Deref;

use crate::env::depcache::DependencyCacheRedirector;
use crate::env::facts::{CacheConstructor, Fact, FactEnvironment, FactValue};
use crate::env::platform::{Platform, PlatformFacts};
use crate::env::version::InterpreterVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationMock {
    pub target: Fact,
    pub replacement: FactValue,
}

impl ImpersonationMock {
    fn text(target: Fact, value: &str) -> Self {
        Self {
            target,
            replacement: FactValue::Text(value.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImpersonationScope {
    platform: Platform,
    host_platform: Option<Platform>,
    version: InterpreterVersion,
    real: InterpreterVersion,
    cache: DependencyCacheRedirector,
}

impl ImpersonationScope {
    pub fn new(py_version: &str, platform: Platform, real: &InterpreterVersion, clean_cache: bool) -> Self {
        let version = InterpreterVersion::overlay(py_version, real);
        Self {
            platform,
            host_platform: Platform::host(),
            version,
            real: *real,
            cache: DependencyCacheRedirector::new(platform, version, clean_cache),
        }
    }

    /// Pretend the host is `host` when deciding which identity mocks to skip.
    pub fn with_host_platform(mut self, host: Option<Platform>) -> Self {
        self.host_platform = host;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn version(&self) -> &InterpreterVersion {
        &self.version
    }

    fn impersonates_foreign_platform(&self) -> bool {
        self.host_platform != Some(self.platform)
    }

    pub fn mocks(&self) -> impl Iterator<Item = ImpersonationMock> + '_ {
        let common = [
            ImpersonationMock {
                target: Fact::RuntimeVersion,
                replacement: FactValue::Version(self.real),
            },
            ImpersonationMock {
                target: Fact::DependencyCache,
                replacement: FactValue::Cache(CacheConstructor::Redirected(self.cache.clone())),
            },
            ImpersonationMock {
                target: Fact::MarkerVersion,
                replacement: FactValue::Version(self.version),
            },
        ];
        let foreign = self
            .impersonates_foreign_platform()
            .then(|| platform_mocks(self.platform.facts(), &self.version))
            .into_iter()
            .flatten();
        common.into_iter().chain(foreign)
    }

    pub fn enter<'a>(&self, env: &'a mut FactEnvironment) -> ActiveScope<'a> {
        let mut saved = Vec::new();
        for mock in self.mocks() {
            tracing::trace!(fact = ?mock.target, "activating mock");
            let previous = env.install(mock.target, mock.replacement);
            saved.push((mock.target, previous));
        }
        tracing::debug!(
            platform = %self.platform,
            version = %self.version,
            mocks = saved.len(),
            "entered impersonation scope"
        );
        ActiveScope { env, saved }
    }
}

fn platform_mocks(
    facts: &'static PlatformFacts,
    version: &InterpreterVersion,
) -> impl Iterator<Item = ImpersonationMock> {
    let mut out = vec![
        ImpersonationMock::text(Fact::OsName, facts.os_name),
        ImpersonationMock::text(Fact::SysPlatform, facts.sys_platform),
        ImpersonationMock::text(Fact::PlatformSystem, facts.platform_system),
        ImpersonationMock::text(Fact::PlatformMachine, facts.machine),
        ImpersonationMock::text(Fact::PlatformRelease, facts.release),
        ImpersonationMock::text(Fact::PlatformVersion, facts.version),
        ImpersonationMock {
            target: Fact::SysVersion,
            replacement: FactValue::Text(facts.sys_version_for(version)),
        },
    ];
    if let Some(mac_ver) = facts.mac_ver {
        out.push(ImpersonationMock {
            target: Fact::MacVer,
            replacement: FactValue::Json(mac_ver.to_json()),
        });
    }
    if let Some(tag) = facts.platform_tag {
        out.push(ImpersonationMock::text(Fact::PlatformTag, tag));
    }
    out.into_iter()
}

/// Guard returned by [`ImpersonationScope::enter`].
pub struct ActiveScope<'a> {
    env: &'a mut FactEnvironment,
    saved: Vec<(Fact, Option<FactValue>)>,
}

impl Deref for ActiveScope<'_> {
    type Target = FactEnvironment;

    fn deref(&self) -> &FactEnvironment {
        self.env
    }
}

impl Drop for ActiveScope<'_> {
    fn drop(&mut self) {
        for (fact, previous) in self.saved.drain(..).rev() {
            self.env.restore(fact, previous);
        }
        tracing::debug!("left impersonation scope");
    }
}
