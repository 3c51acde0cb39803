use anyhow::{Context, bail};
use std::path::{Path, PathBuf};

use crate::config::{DEFAULT_CONFIG_FILE, FileConfig, RunConfig, SOURCE_EXTENSION};
use crate::env::host::HostFacts;
use crate::env::platform::Platform;
use crate::logging::{self, LogCapture};
use crate::resolver::SubprocessResolver;
use crate::run::Orchestrator;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub platform: Option<Platform>,
    pub py_version: Option<String>,
    pub includes: Vec<String>,
    pub output_dir: Option<String>,
    pub output_prefix: Option<String>,
    pub remove_lines: Vec<String>,
    pub passthrough_lines: Vec<String>,
    pub clean_cache: bool,
    pub resolver: Option<String>,
    pub python: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub no_capture: bool,
    pub gen_platform_facts: bool,
    pub config: Option<PathBuf>,
    pub help: bool,
    pub version: bool,
    pub passthrough_args: Vec<String>,
    pub manifests: Vec<PathBuf>,
}

const VALUE_FLAGS: [&str; 11] = [
    "--platform",
    "--py-version",
    "--include",
    "--out-dir",
    "--out-prefix",
    "--remove-line",
    "--passthrough-line-from-input",
    "--resolver",
    "--python",
    "--cache-dir",
    "--log-level",
];

fn looks_like_manifest(arg: &str) -> bool {
    Path::new(arg).extension().and_then(|s| s.to_str()) == Some(SOURCE_EXTENSION)
}

pub fn parse_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut out = CliArgs::default();
    let mut args = args.into_iter();
    let mut after_unknown_flag = false;
    while let Some(arg) = args.next() {
        if arg == "--" {
            out.passthrough_args.extend(args.by_ref());
            break;
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        if VALUE_FLAGS.contains(&flag.as_str()) {
            let value = match inline {
                Some(v) => v,
                None => match args.next() {
                    Some(v) => v,
                    None => bail!("expected a value after {}", flag),
                },
            };
            match flag.as_str() {
                "--platform" => out.platform = Some(value.parse()?),
                "--py-version" => out.py_version = Some(value),
                "--include" => out.includes.push(value),
                "--out-dir" => out.output_dir = Some(value),
                "--out-prefix" => out.output_prefix = Some(value),
                "--remove-line" => out.remove_lines.push(value),
                "--passthrough-line-from-input" => out.passthrough_lines.push(value),
                "--resolver" => out.resolver = Some(value),
                "--python" => out.python = Some(value),
                "--cache-dir" => out.cache_dir = Some(PathBuf::from(value)),
                "--log-level" => out.log_level = Some(value),
                _ => unreachable!("every value flag is matched"),
            }
            after_unknown_flag = false;
            continue;
        }
        match arg.as_str() {
            "--config" => {
                out.config = Some(PathBuf::from(
                    args.next().context("expected a value after --config")?,
                ));
            }
            "--clean-cache" => out.clean_cache = true,
            "--no-capture" => out.no_capture = true,
            "--gen-platform-facts" => out.gen_platform_facts = true,
            "-h" | "--help" => out.help = true,
            "-V" | "--version" => out.version = true,
            _ if flag == "--config" => out.config = inline.map(PathBuf::from),
            _ if arg.starts_with('-') && arg.len() > 1 => {
                out.passthrough_args.push(arg);
                after_unknown_flag = inline.is_none();
                continue;
            }
            _ if after_unknown_flag && !looks_like_manifest(&arg) => {
                // value of an option the resolver understands, e.g. `--index-url URL`
                out.passthrough_args.push(arg);
            }
            _ => out.manifests.push(PathBuf::from(arg)),
        }
        after_unknown_flag = false;
    }
    Ok(out)
}

fn build_config(cli: CliArgs) -> anyhow::Result<RunConfig> {
    let mut cfg = RunConfig::default();
    let config_path = match cli.config {
        Some(p) => Some(p),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    if let Some(path) = config_path {
        cfg.apply_file(FileConfig::load(&path)?)?;
    }
    cfg.apply_env(|k| std::env::var(k).ok());

    if cli.platform.is_some() {
        cfg.platform = cli.platform;
    }
    if cli.py_version.is_some() {
        cfg.py_version = cli.py_version;
    }
    cfg.includes.extend(cli.includes);
    if cli.output_dir.is_some() {
        cfg.output_dir = cli.output_dir;
    }
    if cli.output_prefix.is_some() {
        cfg.output_prefix = cli.output_prefix;
    }
    cfg.remove_lines.extend(cli.remove_lines);
    cfg.passthrough_lines.extend(cli.passthrough_lines);
    cfg.clean_cache |= cli.clean_cache;
    if cli.resolver.is_some() {
        cfg.resolver = cli.resolver;
    }
    if let Some(p) = cli.python {
        cfg.python = p;
    }
    if cli.cache_dir.is_some() {
        cfg.cache_dir = cli.cache_dir;
    }
    if let Some(l) = cli.log_level {
        cfg.log_level = l;
    }
    if cli.no_capture {
        cfg.capture_output = false;
    }
    cfg.passthrough_args = cli.passthrough_args;
    cfg.manifests = cli.manifests;
    Ok(cfg)
}

pub fn version_string() -> String {
    let mut out = format!("crosspin {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("CROSSPIN_GIT_COMMIT") {
        let commit = commit.trim();
        if !commit.is_empty() {
            out.push('#');
            out.push_str(commit);
        }
    }
    out
}

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    match try_run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            1
        }
    }
}

fn try_run<I>(args: I) -> anyhow::Result<i32>
where
    I: IntoIterator<Item = String>,
{
    let cli = match parse_args(args) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {:#}", err);
            print_usage();
            return Ok(1);
        }
    };
    if cli.help {
        print_usage();
        return Ok(0);
    }
    if cli.version {
        println!("{}", version_string());
        return Ok(0);
    }
    let gen_facts = cli.gen_platform_facts;
    let cfg = build_config(cli)?;
    if !gen_facts {
        cfg.validate_manifests()?;
    }

    let capture = LogCapture::new();
    logging::init(&cfg.log_level, &capture)?;

    let host = HostFacts::probe(&cfg.python)?;
    if gen_facts {
        println!("{}", serde_json::to_string_pretty(&host)?);
        return Ok(0);
    }

    let resolver = SubprocessResolver;
    let report = Orchestrator::new(&cfg, host, &resolver, &capture)?.run()?;
    if report.exit_code() != 0 {
        if cfg.capture_output {
            report.echo_captured();
        }
        for (manifest, bundle) in &report.failed {
            eprintln!(
                "failed to resolve {}; diagnostics in {}",
                manifest.display(),
                bundle.display()
            );
        }
    }
    Ok(report.exit_code())
}

fn print_usage() {
    eprintln!("usage: crosspin [options] [resolver options] <requirements.in>...");
    eprintln!("       crosspin --gen-platform-facts");
    eprintln!();
    eprintln!("options:");
    eprintln!("  --platform=<linux|darwin|windows>   platform to pin for (default: host)");
    eprintln!("  --py-version=<X.Y>                  interpreter version to pin for (default: host)");
    eprintln!("  --include=<file>                    extra input file, `{{py_version}}` is expanded");
    eprintln!("  --out-dir=<dir>                     output directory (default: <source dir>/py<X.Y>)");
    eprintln!("  --out-prefix=<prefix>               output file name prefix");
    eprintln!("  --remove-line=<regex>               comment out matching output lines");
    eprintln!("  --passthrough-line-from-input=<regex>  copy matching input lines verbatim");
    eprintln!("  --clean-cache                       purge the per-target dependency cache first");
    eprintln!("  --resolver=<program>                run <program> instead of pip-compile");
    eprintln!("  --python=<program>                  interpreter that is probed and runs pip-compile");
    eprintln!("  --cache-dir=<dir>                   dependency cache directory");
    eprintln!("  --log-level=<level>                 error|warn|info|debug|trace");
    eprintln!("  --no-capture                        echo resolver output as it is produced");
    eprintln!("  --config=<file>                     TOML configuration (default: ./{})", DEFAULT_CONFIG_FILE);
    eprintln!("  --gen-platform-facts                print host facts for a new platform profile");
    eprintln!();
    eprintln!("unrecognized options, and everything after `--`, are passed to the resolver");
}
