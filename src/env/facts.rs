// Purpose: Environment fact provider consulted when building a resolver invocation.
// Inputs/Outputs: Probed host facts + installed overrides -> the facts the resolver must observe.
// Invariants: Queries answer from overrides first, host facts second; removing an override
//             restores the previous answer exactly.
// Gotchas: The dependency cache fact is a constructor, not a value; it is evaluated per call.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::env::depcache::{DependencyCache, DependencyCacheRedirector};
use crate::env::host::HostFacts;
use crate::env::version::InterpreterVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fact {
    OsName,
    SysPlatform,
    PlatformSystem,
    PlatformMachine,
    PlatformRelease,
    PlatformVersion,
    MacVer,
    PlatformTag,
    SysVersion,
    /// Interpreter version used when evaluating environment markers.
    MarkerVersion,
    /// Interpreter version the resolver checks for its own operation.
    RuntimeVersion,
    DependencyCache,
}

impl Fact {
    /// Facts that identify the platform, as opposed to the interpreter or the cache.
    #[cfg(test)]
    pub(crate) const PLATFORM_IDENTITY: [Fact; 8] = [
        Fact::OsName,
        Fact::SysPlatform,
        Fact::PlatformSystem,
        Fact::PlatformMachine,
        Fact::PlatformRelease,
        Fact::PlatformVersion,
        Fact::MacVer,
        Fact::PlatformTag,
    ];

    fn marker_name(self) -> Option<&'static str> {
        match self {
            Fact::OsName => Some("os_name"),
            Fact::SysPlatform => Some("sys_platform"),
            Fact::PlatformSystem => Some("platform_system"),
            Fact::PlatformMachine => Some("platform_machine"),
            Fact::PlatformRelease => Some("platform_release"),
            Fact::PlatformVersion => Some("platform_version"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConstructor {
    Default,
    Redirected(DependencyCacheRedirector),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactValue {
    Text(String),
    Json(Value),
    Version(InterpreterVersion),
    Cache(CacheConstructor),
}

impl FactValue {
    pub fn as_version(&self) -> Option<&InterpreterVersion> {
        match self {
            FactValue::Version(v) => Some(v),
            _ => None,
        }
    }

    fn to_env_string(&self) -> String {
        match self {
            FactValue::Text(s) => s.clone(),
            FactValue::Json(v) => v.to_string(),
            FactValue::Version(v) => v.full(),
            FactValue::Cache(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FactEnvironment {
    host: HostFacts,
    overrides: BTreeMap<Fact, FactValue>,
}

impl FactEnvironment {
    pub fn new(host: HostFacts) -> Self {
        Self {
            host,
            overrides: BTreeMap::new(),
        }
    }

    pub fn host_value(&self, fact: Fact) -> FactValue {
        let h = &self.host;
        match fact {
            Fact::OsName => FactValue::Text(h.os_name.clone()),
            Fact::SysPlatform => FactValue::Text(h.sys_platform.clone()),
            Fact::PlatformSystem => FactValue::Text(h.platform_system.clone()),
            Fact::PlatformMachine => FactValue::Text(h.machine.clone()),
            Fact::PlatformRelease => FactValue::Text(h.release.clone()),
            Fact::PlatformVersion => FactValue::Text(h.version.clone()),
            Fact::MacVer => FactValue::Json(h.mac_ver_json()),
            Fact::PlatformTag => FactValue::Text(h.platform_tag.clone()),
            Fact::SysVersion => FactValue::Text(h.sys_version.clone()),
            Fact::MarkerVersion | Fact::RuntimeVersion => FactValue::Version(h.version_info),
            Fact::DependencyCache => FactValue::Cache(CacheConstructor::Default),
        }
    }

    pub fn get(&self, fact: Fact) -> FactValue {
        match self.overrides.get(&fact) {
            Some(v) => v.clone(),
            None => self.host_value(fact),
        }
    }

    pub fn is_overridden(&self, fact: Fact) -> bool {
        self.overrides.contains_key(&fact)
    }

    pub fn overrides(&self) -> impl Iterator<Item = (Fact, &FactValue)> {
        self.overrides.iter().map(|(f, v)| (*f, v))
    }

    /// Install `value` for `fact`, returning whatever override it displaced.
    pub(crate) fn install(&mut self, fact: Fact, value: FactValue) -> Option<FactValue> {
        self.overrides.insert(fact, value)
    }

    pub(crate) fn restore(&mut self, fact: Fact, previous: Option<FactValue>) {
        match previous {
            Some(v) => {
                self.overrides.insert(fact, v);
            }
            None => {
                self.overrides.remove(&fact);
            }
        }
    }

    pub fn text(&self, fact: Fact) -> String {
        self.get(fact).to_env_string()
    }

    pub fn marker_version(&self) -> InterpreterVersion {
        self.get(Fact::MarkerVersion)
            .as_version()
            .copied()
            .unwrap_or(self.host.version_info)
    }

    pub fn runtime_version(&self) -> InterpreterVersion {
        self.get(Fact::RuntimeVersion)
            .as_version()
            .copied()
            .unwrap_or(self.host.version_info)
    }

    /// Construct the dependency cache the resolver would use under `dir`.
    pub fn dependency_cache(&self, dir: &Path) -> DependencyCache {
        let runtime = self.runtime_version();
        match self.get(Fact::DependencyCache) {
            FactValue::Cache(CacheConstructor::Redirected(r)) => r.construct(dir, &runtime),
            _ => DependencyCache::new(dir, &runtime),
        }
    }

    /// PEP 508 marker variables for every overridden fact, and nothing else.
    pub fn marker_overrides(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (fact, value) in self.overrides() {
            if let Some(name) = fact.marker_name() {
                out.insert(name.to_string(), Value::String(value.to_env_string()));
            }
        }
        if let Some(FactValue::Version(v)) = self.overrides.get(&Fact::MarkerVersion) {
            out.insert("python_version".to_string(), Value::String(v.short()));
            out.insert("python_full_version".to_string(), Value::String(v.full()));
            out.insert("implementation_version".to_string(), Value::String(v.full()));
        }
        out
    }

    /// Raw override values for facts with no marker variable.
    pub fn extra_overrides(&self) -> Vec<(Fact, String)> {
        [Fact::MacVer, Fact::PlatformTag, Fact::SysVersion]
            .into_iter()
            .filter_map(|f| self.overrides.get(&f).map(|v| (f, v.to_env_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::host::sample_host;

    #[test]
    fn overrides_shadow_and_restore_host_values() {
        let mut env = FactEnvironment::new(sample_host());
        let before = env.get(Fact::OsName);
        let prev = env.install(Fact::OsName, FactValue::Text("nt".to_string()));
        assert!(prev.is_none());
        assert_eq!(env.text(Fact::OsName), "nt");
        env.restore(Fact::OsName, prev);
        assert_eq!(env.get(Fact::OsName), before);
        assert!(!env.is_overridden(Fact::OsName));
    }

    #[test]
    fn marker_overrides_only_list_overridden_facts() {
        let mut env = FactEnvironment::new(sample_host());
        assert!(env.marker_overrides().is_empty());

        env.install(Fact::SysPlatform, FactValue::Text("win32".to_string()));
        env.install(
            Fact::MarkerVersion,
            FactValue::Version(InterpreterVersion::new(3, 6, 8)),
        );
        let markers = env.marker_overrides();
        assert_eq!(markers.get("sys_platform"), Some(&Value::from("win32")));
        assert_eq!(markers.get("python_version"), Some(&Value::from("3.6")));
        assert_eq!(markers.get("python_full_version"), Some(&Value::from("3.6.8")));
        assert!(!markers.contains_key("os_name"));
    }

    #[test]
    fn default_cache_uses_runtime_version() {
        let env = FactEnvironment::new(sample_host());
        let cache = env.dependency_cache(Path::new("/c"));
        assert_eq!(cache.path(), Path::new("/c/depcache-py3.9.json"));
    }
}
