// Purpose: Namespace the resolver's on-disk dependency cache by platform and interpreter version.
// Inputs/Outputs: Cache dir + versions -> DependencyCache pointing at a per-target JSON file.
// Invariants: Distinct (platform, version) pairs never share a cache file, and never share the
//             un-redirected default file either.
// Gotchas: Purging is best-effort and happens at most once per path per run.

use anyhow::Context;
use directories::ProjectDirs;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::env::platform::Platform;
use crate::env::version::InterpreterVersion;

pub fn cache_root(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Ok(p) = std::env::var("CROSSPIN_CACHE_DIR")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    if let Some(p) = configured {
        return Ok(p.to_path_buf());
    }
    let pd = ProjectDirs::from("org", "jazzband", "pip-tools")
        .context("cannot determine OS cache directory")?;
    Ok(pd.cache_dir().to_path_buf())
}

/// Handle on the resolver's memoization file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCache {
    dir: PathBuf,
    path: PathBuf,
}

impl DependencyCache {
    /// The cache exactly as the resolver would lay it out on its own.
    pub fn new(dir: &Path, version: &InterpreterVersion) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(format!("depcache-py{}.json", version.short())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> anyhow::Result<CacheLock> {
        CacheLock::acquire(&self.dir)
    }
}

/// Replacement for the resolver's cache constructor.
#[derive(Debug, Clone)]
pub struct DependencyCacheRedirector {
    platform: Platform,
    version: InterpreterVersion,
    clean: bool,
    purged: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PartialEq for DependencyCacheRedirector {
    fn eq(&self, other: &Self) -> bool {
        self.platform == other.platform && self.version == other.version && self.clean == other.clean
    }
}

impl Eq for DependencyCacheRedirector {}

impl DependencyCacheRedirector {
    pub fn new(platform: Platform, version: InterpreterVersion, clean: bool) -> Self {
        Self {
            platform,
            version,
            clean,
            purged: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn file_name(&self) -> String {
        format!("depcache-{}-py{}.json", self.platform, self.version.short())
    }

    /// Build the cache the resolver asked for, then point it at the per-target file.
    pub fn construct(&self, dir: &Path, resolver_version: &InterpreterVersion) -> DependencyCache {
        let mut cache = DependencyCache::new(dir, resolver_version);
        cache.path = cache.dir.join(self.file_name());
        if self.clean {
            self.purge_once(&cache.path);
        }
        cache
    }

    fn purge_once(&self, path: &Path) {
        let mut purged = match self.purged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !purged.insert(path.to_path_buf()) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed dependency cache"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not remove dependency cache")
            }
        }
    }
}

pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    pub fn acquire(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let lock_path = root.join("depcache.lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open {}", lock_path.display()))?;
        f.lock_exclusive()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        Ok(Self { _file: f })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("crosspin-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    #[test]
    fn redirected_paths_are_distinct_per_target() {
        let dir = Path::new("/cache");
        let real = InterpreterVersion::new(3, 9, 1);
        let default = DependencyCache::new(dir, &real);

        let mut seen = HashSet::new();
        seen.insert(default.path().to_path_buf());
        for platform in [Platform::Linux, Platform::Darwin, Platform::Windows] {
            for minor in [5, 8, 9, 10] {
                let target = InterpreterVersion::overlay(&format!("3.{}", minor), &real);
                let cache = DependencyCacheRedirector::new(platform, target, false).construct(dir, &real);
                assert_eq!(cache.dir(), dir);
                assert!(
                    seen.insert(cache.path().to_path_buf()),
                    "duplicate cache path {}",
                    cache.path().display()
                );
            }
        }
    }

    #[test]
    fn redirected_file_name_encodes_platform_and_version() {
        let r = DependencyCacheRedirector::new(Platform::Darwin, InterpreterVersion::new(3, 7, 0), false);
        let cache = r.construct(Path::new("/c"), &InterpreterVersion::new(3, 11, 2));
        assert_eq!(cache.path(), Path::new("/c/depcache-darwin-py3.7.json"));
    }

    #[test]
    fn clean_purges_existing_file_only_once() {
        let dir = temp_dir("depcache-clean");
        fs::create_dir_all(&dir).expect("mkdir");
        let r = DependencyCacheRedirector::new(Platform::Linux, InterpreterVersion::new(3, 8, 0), true);
        let target = dir.join(r.file_name());
        fs::write(&target, "{}").expect("seed cache");

        let cache = r.construct(&dir, &InterpreterVersion::new(3, 9, 0));
        assert_eq!(cache.path(), target);
        assert!(!target.exists(), "first construction must purge");

        fs::write(&target, "{\"kept\": true}").expect("rewrite cache");
        let _ = r.clone().construct(&dir, &InterpreterVersion::new(3, 9, 0));
        assert!(target.exists(), "purge happens once per run");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn clean_on_missing_file_is_not_an_error() {
        let dir = temp_dir("depcache-missing");
        let r = DependencyCacheRedirector::new(Platform::Windows, InterpreterVersion::new(3, 8, 0), true);
        let cache = r.construct(&dir, &InterpreterVersion::new(3, 8, 0));
        assert!(!cache.path().exists());
    }

    #[test]
    fn lock_creates_cache_dir() {
        let dir = temp_dir("depcache-lock");
        let cache = DependencyCache::new(&dir, &InterpreterVersion::new(3, 8, 0));
        let lock = cache.lock().expect("lock");
        assert!(dir.join("depcache.lock").exists());
        drop(lock);
        let _ = fs::remove_dir_all(dir);
    }
}
