// Purpose: Drive every manifest through extraction, impersonated resolution, reinjection, filtering.
// Inputs/Outputs: RunConfig + HostFacts + Resolver -> pinned files or diagnostic bundles, RunReport.
// Invariants: Manifests run one at a time; the impersonation scope and all input backups are torn
//             down before the next manifest starts. A resolver failure never aborts the run.
// Gotchas: Only resolver failures are recovered; filesystem errors elsewhere end the run.

use anyhow::Context;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::env::depcache::cache_root;
use crate::env::facts::FactEnvironment;
use crate::env::host::HostFacts;
use crate::env::platform::Platform;
use crate::env::scope::ImpersonationScope;
use crate::logging::LogCapture;
use crate::pipeline::{Extraction, PatternRules, filter_file};
use crate::resolver::{Resolver, ResolverCommand, ResolverInvocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestState {
    Pending,
    Extracting,
    Resolving,
    Succeeded,
    Failed,
    Filtering,
    Done,
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManifestState::Pending => "pending",
            ManifestState::Extracting => "extracting",
            ManifestState::Resolving => "resolving",
            ManifestState::Succeeded => "succeeded",
            ManifestState::Failed => "failed",
            ManifestState::Filtering => "filtering",
            ManifestState::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CompileResult {
    pub manifest: PathBuf,
    pub success: bool,
    pub dest: PathBuf,
    pub command: String,
    pub log: String,
    pub stdout: String,
    pub stderr: String,
}

fn section(out: &mut String, name: &str, body: &str) {
    let bar = ">".repeat(20);
    let end = "<".repeat(20);
    out.push_str(&format!("{} {} {}\n", bar, name, bar));
    out.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("{} {} {}\n", end, name, end));
}

impl CompileResult {
    pub fn diagnostic_path(&self) -> PathBuf {
        self.dest.with_extension("log")
    }

    pub fn render_bundle(&self) -> String {
        let mut out = format!(
            "crosspin failed to resolve {}\ncommand: {}\n\n",
            self.manifest.display(),
            self.command
        );
        section(&mut out, "LOG", &self.log);
        section(&mut out, "STDOUT", &self.stdout);
        section(&mut out, "STDERR", &self.stderr);
        out
    }

    pub fn write_bundle(&self) -> anyhow::Result<PathBuf> {
        let path = self.diagnostic_path();
        fs::write(&path, self.render_bundle()).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<PathBuf>,
    /// (manifest, diagnostic bundle)
    pub failed: Vec<(PathBuf, PathBuf)>,
    pub stdout: String,
    pub stderr: String,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() { 0 } else { 1 }
    }

    /// Replay the captured resolver output on the real streams.
    pub fn echo_captured(&self) {
        if !self.stdout.is_empty() {
            print!("{}", self.stdout);
        }
        if !self.stderr.is_empty() {
            eprint!("{}", self.stderr);
        }
    }
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

pub struct Orchestrator<'a, R: Resolver> {
    config: &'a RunConfig,
    resolver: &'a R,
    capture: &'a LogCapture,
    command: ResolverCommand,
    facts: FactEnvironment,
    scope: ImpersonationScope,
    passthrough: PatternRules,
    removals: PatternRules,
    cache_dir: PathBuf,
}

impl<'a, R: Resolver> Orchestrator<'a, R> {
    pub fn new(
        config: &'a RunConfig,
        host: HostFacts,
        resolver: &'a R,
        capture: &'a LogCapture,
    ) -> anyhow::Result<Self> {
        let py_version = config
            .py_version
            .clone()
            .unwrap_or_else(|| host.version_info.short());
        let platform = config
            .platform
            .or_else(Platform::host)
            .unwrap_or(Platform::Linux);
        let scope = ImpersonationScope::new(&py_version, platform, &host.version_info, config.clean_cache);
        for warning in host.support_warnings(scope.version()) {
            tracing::warn!("{}", warning);
        }
        Ok(Self {
            config,
            resolver,
            capture,
            command: ResolverCommand::from_config(config),
            passthrough: PatternRules::compile(&config.passthrough_lines)?,
            removals: PatternRules::compile(&config.remove_lines)?,
            cache_dir: cache_root(config.cache_dir.as_deref())?,
            facts: FactEnvironment::new(host),
            scope,
        })
    }

    pub fn scope(&self) -> &ImpersonationScope {
        &self.scope
    }

    pub fn run(&mut self) -> anyhow::Result<RunReport> {
        let config = self.config;
        let mut report = RunReport::default();
        for manifest in &config.manifests {
            let result = self.process(manifest)?;
            if !config.capture_output {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            report.stdout.push_str(&result.stdout);
            report.stderr.push_str(&result.stderr);
            if result.success {
                report.succeeded.push(result.dest);
            } else {
                let bundle = result.write_bundle()?;
                report.failed.push((manifest.clone(), bundle));
            }
        }
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "run finished"
        );
        Ok(report)
    }

    fn transition(&self, manifest: &Path, state: ManifestState) {
        tracing::debug!(manifest = %manifest.display(), state = %state, "manifest state");
    }

    fn process(&mut self, manifest: &Path) -> anyhow::Result<CompileResult> {
        self.transition(manifest, ManifestState::Pending);
        let version = *self.scope.version();
        let dest = self.config.output_path(manifest, &version);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        remove_if_present(&dest)?;

        self.transition(manifest, ManifestState::Extracting);
        let mut inputs = self.config.include_paths(&version);
        inputs.push(manifest.to_path_buf());
        let extraction = Extraction::run(&inputs, &self.passthrough)?;

        self.transition(manifest, ManifestState::Resolving);
        let (invocation, outcome) = {
            let active = self.scope.enter(&mut self.facts);
            let cache = active.dependency_cache(&self.cache_dir);
            let _lock = cache.lock()?;
            let invocation = ResolverInvocation::build(
                &self.command,
                &dest,
                &self.config.passthrough_args,
                &extraction.resolver_paths(),
                &self.scope,
                &active,
                &cache,
            );
            tracing::info!(
                manifest = %manifest.display(),
                platform = %self.scope.platform(),
                python = %version.short(),
                "resolving"
            );
            tracing::debug!(command = %invocation.command_line(), cache = %cache.path().display());
            let outcome = self.resolver.resolve(&invocation);
            (invocation, outcome)
        };

        let mut result = CompileResult {
            manifest: manifest.to_path_buf(),
            success: false,
            dest: dest.clone(),
            command: invocation.command_line(),
            log: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        };
        match outcome {
            Ok(out) => {
                result.success = out.success();
                if !result.success {
                    tracing::error!(exit_code = ?out.exit_code, "resolver exited unsuccessfully");
                } else if !dest.exists() {
                    result.success = false;
                    tracing::error!(dest = %dest.display(), "resolver reported success but wrote no output");
                }
                result.stdout = out.stdout;
                result.stderr = out.stderr;
            }
            Err(err) => {
                tracing::error!(error = %format!("{:#}", err), "resolver could not be run");
                result.stderr = format!("{:#}\n", err);
            }
        }

        if !result.success {
            self.transition(manifest, ManifestState::Failed);
            drop(extraction);
            remove_if_present(&dest)?;
            tracing::error!(
                manifest = %manifest.display(),
                bundle = %result.diagnostic_path().display(),
                "failed to resolve; see the diagnostic bundle"
            );
            result.log = self.capture.take();
            return Ok(result);
        }

        self.transition(manifest, ManifestState::Succeeded);
        extraction.reinject(&dest, manifest.parent().unwrap_or_else(|| Path::new("")))?;
        drop(extraction);

        self.transition(manifest, ManifestState::Filtering);
        filter_file(&dest, &self.removals)?;
        remove_if_present(&result.diagnostic_path())?;

        self.transition(manifest, ManifestState::Done);
        tracing::info!(output = %dest.display(), "wrote pinned requirements");
        result.log = self.capture.take();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::host::sample_host;
    use crate::resolver::{ENV_MARKERS, ResolverOutput};
    use std::cell::RefCell;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "crosspin-{}-{}-{}",
            prefix,
            std::process::id(),
            nonce
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    struct FnResolver<F> {
        f: F,
        calls: RefCell<Vec<ResolverInvocation>>,
    }

    impl<F> FnResolver<F>
    where
        F: Fn(&ResolverInvocation) -> anyhow::Result<ResolverOutput>,
    {
        fn new(f: F) -> Self {
            Self {
                f,
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl<F> Resolver for FnResolver<F>
    where
        F: Fn(&ResolverInvocation) -> anyhow::Result<ResolverOutput>,
    {
        fn resolve(&self, invocation: &ResolverInvocation) -> anyhow::Result<ResolverOutput> {
            self.calls.borrow_mut().push(invocation.clone());
            (self.f)(invocation)
        }
    }

    fn last_input(inv: &ResolverInvocation) -> PathBuf {
        PathBuf::from(inv.args.last().expect("source arg"))
    }

    /// Pins whatever the last input lists, with a transitive dep for flask.
    fn pinning(inv: &ResolverInvocation) -> anyhow::Result<ResolverOutput> {
        let input = last_input(inv);
        let text = fs::read_to_string(&input)?;
        let name = input.file_name().expect("name").to_string_lossy().into_owned();
        let mut out = String::from("#\n# generated by a fake resolver\n#\n");
        for line in text.lines() {
            if line.starts_with("flask") {
                out.push_str("click==7.0\n    # via flask\n");
            }
            out.push_str(&format!("{}\n    # via -r {}\n", line, name));
        }
        fs::write(&inv.dest, out)?;
        Ok(ResolverOutput {
            exit_code: Some(0),
            stdout: "resolved\n".to_string(),
            stderr: String::new(),
        })
    }

    fn config(root: &Path, manifests: Vec<PathBuf>) -> RunConfig {
        RunConfig {
            py_version: Some("3.8".to_string()),
            platform: Some(Platform::Windows),
            cache_dir: Some(root.join("cache")),
            manifests,
            ..RunConfig::default()
        }
    }

    #[test]
    fn passthrough_lines_survive_resolution() {
        let root = temp_dir("run-e2e");
        let manifest = root.join("requirements.in");
        let original = "flask==1.0\n--extra-index-url https://example.com\n";
        fs::write(&manifest, original).expect("write manifest");

        let mut cfg = config(&root, vec![manifest.clone()]);
        cfg.passthrough_lines = vec!["^--extra-index-url".to_string()];
        let resolver = FnResolver::new(|inv: &ResolverInvocation| {
            let fed = fs::read_to_string(last_input(inv))?;
            assert!(!fed.contains("--extra-index-url"), "passthrough line leaked: {}", fed);
            pinning(inv)
        });
        let capture = LogCapture::new();
        let report = Orchestrator::new(&cfg, sample_host(), &resolver, &capture)
            .expect("orchestrator")
            .run()
            .expect("run");

        assert_eq!(report.exit_code(), 0);
        let dest = root.join("py3.8").join("requirements.txt");
        assert_eq!(report.succeeded, vec![dest.clone()]);
        let out = fs::read_to_string(&dest).expect("read output");
        assert!(out.contains("click==7.0"), "{}", out);
        assert!(out.contains("flask==1.0\n    # via -r requirements.in"), "{}", out);
        assert!(
            out.ends_with(
                "# Passthrough dependencies from requirements.in\n--extra-index-url https://example.com\n"
            ),
            "{}",
            out
        );
        assert_eq!(fs::read_to_string(&manifest).expect("restored"), original);
        assert!(!dest.with_extension("log").exists());
        assert_eq!(report.stdout, "resolved\n");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_manifest_writes_bundle_and_run_continues() {
        let root = temp_dir("run-failure");
        let bad = root.join("bad.in");
        let good = root.join("good.in");
        fs::write(&bad, "-e ./nowhere\nbroken\n").expect("write bad");
        fs::write(&good, "six\n").expect("write good");

        let mut cfg = config(&root, vec![bad.clone(), good.clone()]);
        cfg.passthrough_lines = vec!["^-e ".to_string()];
        let resolver = FnResolver::new(|inv: &ResolverInvocation| {
            if last_input(inv).to_string_lossy().contains("bad") {
                fs::write(&inv.dest, "partial\n")?;
                return Ok(ResolverOutput {
                    exit_code: Some(2),
                    stdout: "looking up broken\n".to_string(),
                    stderr: "Could not find a version that matches broken\n".to_string(),
                });
            }
            pinning(inv)
        });
        let capture = LogCapture::new();
        let report = Orchestrator::new(&cfg, sample_host(), &resolver, &capture)
            .expect("orchestrator")
            .run()
            .expect("run");

        assert_eq!(report.exit_code(), 1);
        let bad_txt = root.join("py3.8").join("bad.txt");
        assert!(!bad_txt.exists(), "no pin file on failure");
        let bundle = fs::read_to_string(bad_txt.with_extension("log")).expect("bundle");
        for name in ["LOG", "STDOUT", "STDERR"] {
            assert!(bundle.contains(&format!(" {} ", name)), "missing {} in {}", name, bundle);
        }
        assert!(bundle.contains("Could not find a version that matches broken"));
        assert!(bundle.contains("looking up broken"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad);

        assert!(root.join("py3.8").join("good.txt").exists());
        assert_eq!(fs::read_to_string(&bad).expect("restored"), "-e ./nowhere\nbroken\n");
        assert!(report.stderr.contains("Could not find a version"));
        assert_eq!(resolver.calls.borrow().len(), 2);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failure_log_lands_in_its_own_bundle() {
        use tracing_subscriber::filter::LevelFilter;
        use tracing_subscriber::prelude::*;

        let root = temp_dir("run-bundle-log");
        let first = root.join("first.in");
        let second = root.join("second.in");
        fs::write(&first, "broken\n").expect("write first");
        fs::write(&second, "broken\n").expect("write second");
        let cfg = config(&root, vec![first.clone(), second.clone()]);
        let resolver = FnResolver::new(|_: &ResolverInvocation| {
            Ok(ResolverOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "no match\n".to_string(),
            })
        });
        let capture = LogCapture::new();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(capture.clone())
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        );
        let report = tracing::subscriber::with_default(subscriber, || {
            Orchestrator::new(&cfg, sample_host(), &resolver, &capture)
                .expect("orchestrator")
                .run()
                .expect("run")
        });
        assert_eq!(report.failed.len(), 2);

        let first_log = fs::read_to_string(root.join("py3.8").join("first.log")).expect("first bundle");
        let second_log =
            fs::read_to_string(root.join("py3.8").join("second.log")).expect("second bundle");
        assert!(first_log.contains("failed to resolve; see the diagnostic bundle"), "{}", first_log);
        assert!(first_log.contains("first.log"), "{}", first_log);
        assert!(!second_log.contains("first.log"), "{}", second_log);
        assert!(second_log.contains("second.log"), "{}", second_log);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resolver_fault_is_a_failure() {
        let root = temp_dir("run-fault");
        let manifest = root.join("base.in");
        fs::write(&manifest, "six\n").expect("write");
        let cfg = config(&root, vec![manifest]);
        let resolver =
            FnResolver::new(|_: &ResolverInvocation| Err(anyhow::anyhow!("pip-compile: not found")));
        let capture = LogCapture::new();
        let report = Orchestrator::new(&cfg, sample_host(), &resolver, &capture)
            .expect("orchestrator")
            .run()
            .expect("run");
        assert_eq!(report.exit_code(), 1);
        let bundle = fs::read_to_string(root.join("py3.8").join("base.log")).expect("bundle");
        assert!(bundle.contains("pip-compile: not found"), "{}", bundle);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn removal_rules_apply_after_reinjection() {
        let root = temp_dir("run-filter");
        let manifest = root.join("base.in");
        fs::write(&manifest, "pywin32==300\nsix\n--trusted-host example.com\n").expect("write");
        let mut cfg = config(&root, vec![manifest]);
        cfg.passthrough_lines = vec!["^--trusted-host".to_string()];
        cfg.remove_lines = vec!["^pywin32".to_string(), "^--trusted-host".to_string()];
        let resolver = FnResolver::new(pinning);
        let capture = LogCapture::new();
        Orchestrator::new(&cfg, sample_host(), &resolver, &capture)
            .expect("orchestrator")
            .run()
            .expect("run");
        let out = fs::read_to_string(root.join("py3.8").join("base.txt")).expect("read");
        assert!(out.contains("# pywin32==300"), "{}", out);
        assert!(out.contains("# --trusted-host example.com"), "{}", out);
        assert!(out.contains("\nsix\n") || out.contains("\nsix\r\n"), "{}", out);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn includes_are_templated_and_fed_before_source() {
        let root = temp_dir("run-include");
        let manifest = root.join("base.in");
        fs::write(&manifest, "six\n").expect("write");
        let inc_dir = root.join("static").join("3.8");
        fs::create_dir_all(&inc_dir).expect("mkdir");
        fs::write(inc_dir.join("constraints.txt"), "six==1.16.0\n").expect("write include");

        let mut cfg = config(&root, vec![manifest.clone()]);
        cfg.includes = vec![format!("{}/static/{{py_version}}/constraints.txt", root.display())];
        cfg.passthrough_args = vec!["--no-header".to_string()];
        let resolver = FnResolver::new(pinning);
        let capture = LogCapture::new();
        let mut orchestrator =
            Orchestrator::new(&cfg, sample_host(), &resolver, &capture).expect("orchestrator");
        assert_eq!(orchestrator.scope().platform(), Platform::Windows);
        orchestrator.run().expect("run");

        let calls = resolver.calls.borrow();
        let args: Vec<String> = calls[0]
            .resolver_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-o");
        assert_eq!(args[2], "--no-header");
        assert_eq!(PathBuf::from(&args[3]), inc_dir.join("constraints.txt"));
        assert_eq!(PathBuf::from(&args[4]), manifest);
        let markers: serde_json::Value =
            serde_json::from_str(&calls[0].env[ENV_MARKERS]).expect("markers");
        assert_eq!(markers["python_version"], "3.8");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bundle_sections_are_delimited() {
        let result = CompileResult {
            manifest: PathBuf::from("base.in"),
            success: false,
            dest: PathBuf::from("py3.8/base.txt"),
            command: "pip-compile -o py3.8/base.txt base.in".to_string(),
            log: "ERROR boom".to_string(),
            stdout: String::new(),
            stderr: "trace\n".to_string(),
        };
        assert_eq!(result.diagnostic_path(), PathBuf::from("py3.8/base.log"));
        let text = result.render_bundle();
        let expected_tail = format!(
            "{b} LOG {b}\nERROR boom\n{e} LOG {e}\n{b} STDOUT {b}\n{e} STDOUT {e}\n{b} STDERR {b}\ntrace\n{e} STDERR {e}\n",
            b = ">".repeat(20),
            e = "<".repeat(20)
        );
        assert!(text.ends_with(&expected_tail), "{}", text);
    }
}
