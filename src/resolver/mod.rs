// Purpose: Invoke the external dependency resolver as a subprocess with impersonated facts.
// Inputs/Outputs: Destination, passthrough args, input paths, active facts -> captured output.
// Invariants: Resolver arguments are `-o <dest> <passthrough...> <includes...> <source>`.
// Gotchas: Facts reach the resolver only through CROSSPIN_* variables; a fact that is not
//          overridden is not exported, so the resolver keeps observing its real value.
//          pip-compile itself ignores them, so by default it runs under bootstrap.py,
//          which applies them before handing over to pip-compile's entry point.

use anyhow::Context;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::RunConfig;
use crate::env::depcache::DependencyCache;
use crate::env::facts::{Fact, FactEnvironment};
use crate::env::scope::ImpersonationScope;

pub const ENV_MARKERS: &str = "CROSSPIN_MARKER_ENV";
pub const ENV_MAC_VER: &str = "CROSSPIN_MAC_VER";
pub const ENV_PLATFORM_TAG: &str = "CROSSPIN_PLATFORM_TAG";
pub const ENV_SYS_VERSION: &str = "CROSSPIN_SYS_VERSION";
pub const ENV_RUNTIME_PYTHON: &str = "CROSSPIN_RUNTIME_PYTHON";
pub const ENV_DEPCACHE: &str = "CROSSPIN_DEPCACHE";
pub const ENV_TARGET_PLATFORM: &str = "CROSSPIN_TARGET_PLATFORM";
pub const ENV_TARGET_PYTHON: &str = "CROSSPIN_TARGET_PYTHON";

/// Script that applies the CROSSPIN_* facts inside the interpreter, then runs pip-compile.
pub const BOOTSTRAP: &str = include_str!("bootstrap.py");

const BOOTSTRAP_PLACEHOLDER: &str = "<crosspin-bootstrap>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverCommand {
    /// pip-compile loaded in-process by `python -c BOOTSTRAP`.
    Bootstrap { python: String },
    /// A program that reads the CROSSPIN_* variables itself.
    External(String),
}

impl ResolverCommand {
    pub fn from_config(config: &RunConfig) -> Self {
        match &config.resolver {
            Some(program) => ResolverCommand::External(program.clone()),
            None => ResolverCommand::Bootstrap {
                python: config.python.clone(),
            },
        }
    }

    fn program(&self) -> &str {
        match self {
            ResolverCommand::Bootstrap { python } => python.as_str(),
            ResolverCommand::External(program) => program.as_str(),
        }
    }

    fn prelude(&self) -> Vec<OsString> {
        match self {
            ResolverCommand::Bootstrap { .. } => vec!["-c".into(), BOOTSTRAP.into()],
            ResolverCommand::External(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverInvocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub dest: PathBuf,
    prelude: usize,
}

impl ResolverInvocation {
    pub fn build(
        command: &ResolverCommand,
        dest: &Path,
        passthrough: &[String],
        inputs: &[PathBuf],
        scope: &ImpersonationScope,
        facts: &FactEnvironment,
        cache: &DependencyCache,
    ) -> Self {
        let mut args = command.prelude();
        let prelude = args.len();
        args.push("-o".into());
        args.push(dest.as_os_str().to_os_string());
        args.extend(passthrough.iter().map(OsString::from));
        args.extend(inputs.iter().map(|p| p.as_os_str().to_os_string()));

        let mut env = BTreeMap::new();
        env.insert(
            ENV_MARKERS.to_string(),
            serde_json::Value::Object(facts.marker_overrides()).to_string(),
        );
        for (fact, value) in facts.extra_overrides() {
            let key = match fact {
                Fact::MacVer => ENV_MAC_VER,
                Fact::PlatformTag => ENV_PLATFORM_TAG,
                Fact::SysVersion => ENV_SYS_VERSION,
                _ => continue,
            };
            env.insert(key.to_string(), value);
        }
        env.insert(ENV_RUNTIME_PYTHON.to_string(), facts.runtime_version().full());
        env.insert(ENV_DEPCACHE.to_string(), cache.path().display().to_string());
        env.insert(ENV_TARGET_PLATFORM.to_string(), scope.platform().to_string());
        env.insert(ENV_TARGET_PYTHON.to_string(), scope.version().full());

        Self {
            program: command.program().to_string(),
            args,
            env,
            dest: dest.to_path_buf(),
            prelude,
        }
    }

    /// The arguments pip-compile sees, without the interpreter prelude.
    pub fn resolver_args(&self) -> &[OsString] {
        &self.args[self.prelude..]
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.as_os_str() == BOOTSTRAP {
                BOOTSTRAP_PLACEHOLDER.to_string()
            } else {
                a.to_string_lossy().into_owned()
            }
        }));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ResolverOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Something that turns an invocation into a pinned file.
pub trait Resolver {
    /// An `Err` means the resolver could not run at all; a non-zero exit is an `Ok`.
    fn resolve(&self, invocation: &ResolverInvocation) -> anyhow::Result<ResolverOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessResolver;

impl Resolver for SubprocessResolver {
    fn resolve(&self, invocation: &ResolverInvocation) -> anyhow::Result<ResolverOutput> {
        let out = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .output()
            .with_context(|| format!("failed to execute {}", invocation.program))?;
        Ok(ResolverOutput {
            exit_code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}
