// Purpose: Layered run configuration: defaults, optional TOML file, environment, command line.
// Inputs/Outputs: crosspin.toml / CROSSPIN_* variables / parsed flags -> RunConfig.
// Invariants: Later layers override scalars and extend lists of earlier ones.
// Gotchas: Include paths and the output dir are templates; `{py_version}` is filled per run.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::env::platform::Platform;
use crate::env::version::InterpreterVersion;

pub const DEFAULT_CONFIG_FILE: &str = "crosspin.toml";
pub const SOURCE_EXTENSION: &str = "in";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub platform: Option<String>,
    pub py_version: Option<String>,
    pub include: Vec<String>,
    pub output_dir: Option<String>,
    pub output_prefix: Option<String>,
    pub remove_line: Vec<String>,
    pub passthrough_line: Vec<String>,
    pub clean_cache: bool,
    pub resolver: Option<String>,
    pub python: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub capture_output: Option<bool>,
}

impl FileConfig {
    pub fn parse(toml_text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<FileConfig>(toml_text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub platform: Option<Platform>,
    pub py_version: Option<String>,
    pub includes: Vec<String>,
    pub output_dir: Option<String>,
    pub output_prefix: Option<String>,
    pub remove_lines: Vec<String>,
    pub passthrough_lines: Vec<String>,
    pub clean_cache: bool,
    /// Program run in place of the bootstrapped pip-compile.
    pub resolver: Option<String>,
    pub python: String,
    pub cache_dir: Option<PathBuf>,
    pub log_level: String,
    pub capture_output: bool,
    pub passthrough_args: Vec<String>,
    pub manifests: Vec<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            platform: None,
            py_version: None,
            includes: vec![],
            output_dir: None,
            output_prefix: None,
            remove_lines: vec![],
            passthrough_lines: vec![],
            clean_cache: false,
            resolver: None,
            python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
            cache_dir: None,
            log_level: "info".to_string(),
            capture_output: true,
            passthrough_args: vec![],
            manifests: vec![],
        }
    }
}

fn render(template: &str, version: &InterpreterVersion) -> String {
    template.replace("{py_version}", &version.short())
}

impl RunConfig {
    pub fn apply_file(&mut self, file: FileConfig) -> anyhow::Result<()> {
        if let Some(p) = file.platform {
            self.platform = Some(p.parse()?);
        }
        if file.py_version.is_some() {
            self.py_version = file.py_version;
        }
        self.includes.extend(file.include);
        if file.output_dir.is_some() {
            self.output_dir = file.output_dir;
        }
        if file.output_prefix.is_some() {
            self.output_prefix = file.output_prefix;
        }
        self.remove_lines.extend(file.remove_line);
        self.passthrough_lines.extend(file.passthrough_line);
        self.clean_cache |= file.clean_cache;
        if file.resolver.is_some() {
            self.resolver = file.resolver;
        }
        if let Some(p) = file.python {
            self.python = p;
        }
        if file.cache_dir.is_some() {
            self.cache_dir = file.cache_dir;
        }
        if let Some(l) = file.log_level {
            self.log_level = l;
        }
        if let Some(c) = file.capture_output {
            self.capture_output = c;
        }
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CROSSPIN_CAPTURE_OUTPUT") {
            self.capture_output = !matches!(v.trim(), "0" | "false" | "no" | "off");
        }
        if let Some(v) = lookup("CROSSPIN_LOG")
            && !v.trim().is_empty()
        {
            self.log_level = v;
        }
    }

    pub fn validate_manifests(&self) -> anyhow::Result<()> {
        if self.manifests.is_empty() {
            bail!("no requirement files given");
        }
        for m in &self.manifests {
            if m.extension().and_then(|s| s.to_str()) != Some(SOURCE_EXTENSION) {
                bail!(
                    "expected a .{} requirements file, got {}",
                    SOURCE_EXTENSION,
                    m.display()
                );
            }
        }
        Ok(())
    }

    pub fn include_paths(&self, version: &InterpreterVersion) -> Vec<PathBuf> {
        self.includes
            .iter()
            .map(|i| PathBuf::from(render(i, version)))
            .collect()
    }

    /// `<out-dir>/<prefix>-<stem>.txt`, defaulting to `<source-dir>/py<M.m>/<stem>.txt`.
    pub fn output_path(&self, source: &Path, version: &InterpreterVersion) -> PathBuf {
        let dir = match &self.output_dir {
            Some(d) => PathBuf::from(render(d, version)),
            None => source
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(format!("py{}", version.short())),
        };
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.output_prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{}-{}.txt", prefix, stem),
            None => format!("{}.txt", stem),
        };
        dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_overrides_defaults_and_rejects_unknown_keys() {
        let file = FileConfig::parse(
            r#"
platform = "windows"
py_version = "3.7"
include = ["requirements/static/{py_version}/base.txt"]
passthrough_line = ["^--extra-index-url"]
clean_cache = true
"#,
        )
        .expect("parse");
        let mut cfg = RunConfig::default();
        cfg.apply_file(file).expect("apply");
        assert_eq!(cfg.platform, Some(Platform::Windows));
        assert_eq!(cfg.py_version.as_deref(), Some("3.7"));
        assert!(cfg.clean_cache);
        assert_eq!(cfg.resolver, None);
        assert_eq!(
            cfg.include_paths(&InterpreterVersion::new(3, 7, 2)),
            vec![PathBuf::from("requirements/static/3.7/base.txt")]
        );

        assert!(FileConfig::parse("platfrom = \"linux\"\n").is_err());
    }

    #[test]
    fn bad_platform_in_file_is_an_error() {
        let file = FileConfig::parse("platform = \"bsd\"\n").expect("parse");
        assert!(RunConfig::default().apply_file(file).is_err());
    }

    #[test]
    fn env_layer_toggles_capture() {
        let mut cfg = RunConfig::default();
        cfg.apply_env(|k| (k == "CROSSPIN_CAPTURE_OUTPUT").then(|| "0".to_string()));
        assert!(!cfg.capture_output);
        cfg.apply_env(|k| (k == "CROSSPIN_LOG").then(|| "debug".to_string()));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn output_path_defaults_next_to_source() {
        let cfg = RunConfig::default();
        let v = InterpreterVersion::new(3, 8, 1);
        assert_eq!(
            cfg.output_path(Path::new("reqs/requirements.in"), &v),
            PathBuf::from("reqs/py3.8/requirements.txt")
        );
        assert_eq!(
            cfg.output_path(Path::new("requirements.in"), &v),
            PathBuf::from("py3.8/requirements.txt")
        );
    }

    #[test]
    fn output_path_honors_dir_and_prefix() {
        let cfg = RunConfig {
            output_dir: Some("static/py{py_version}".to_string()),
            output_prefix: Some("windows".to_string()),
            ..RunConfig::default()
        };
        assert_eq!(
            cfg.output_path(Path::new("reqs/base.in"), &InterpreterVersion::new(3, 6, 0)),
            PathBuf::from("static/py3.6/windows-base.txt")
        );
    }

    #[test]
    fn manifests_must_be_source_files() {
        let mut cfg = RunConfig::default();
        assert!(cfg.validate_manifests().is_err());
        cfg.manifests = vec![PathBuf::from("a.in"), PathBuf::from("b.txt")];
        let err = cfg.validate_manifests().expect_err("b.txt rejected");
        assert!(err.to_string().contains("b.txt"), "{}", err);
    }
}
