// Purpose: Strip passthrough lines from input files before resolution and reinject them after.
// Inputs/Outputs: Input paths + PatternRules -> Extraction (paths for the resolver, rewrite states).
// Invariants: Files with no matching line are never touched. Every moved-aside original is
//             restored when the Extraction drops, whatever happened in between.
// Gotchas: The resolver records its input paths in provenance comments; reinjection maps the
//          intermediate file names back to the originals. Lines keep their own endings, so
//          CRLF manifests round-trip byte for byte.

use anyhow::Context;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::pipeline::rules::PatternRules;

fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

fn sibling(path: &Path, file_name: String) -> PathBuf {
    path.with_file_name(file_name)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct RewriteState {
    pub original: PathBuf,
    pub backup: PathBuf,
    pub rewritten: PathBuf,
    pub extracted: Vec<String>,
    digest: String,
}

impl RewriteState {
    fn new(original: &Path, extracted: Vec<String>, digest: String) -> Self {
        let name = file_name_of(original);
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let rewritten = match original.extension() {
            Some(ext) => format!("{}.crosspin-stripped.{}", stem, ext.to_string_lossy()),
            None => format!("{}.crosspin-stripped", stem),
        };
        Self {
            original: original.to_path_buf(),
            backup: sibling(original, format!("{}.crosspin-backup", name)),
            rewritten: sibling(original, rewritten),
            extracted,
            digest,
        }
    }

    fn restore(&self) {
        remove_if_present(&self.rewritten);
        if let Err(err) = fs::rename(&self.backup, &self.original) {
            tracing::error!(
                original = %self.original.display(),
                backup = %self.backup.display(),
                error = %err,
                "failed to restore original file"
            );
            return;
        }
        match fs::read(&self.original) {
            Ok(bytes) if sha256_hex(&bytes) == self.digest => {
                tracing::debug!(path = %self.original.display(), "restored original file");
            }
            Ok(_) => tracing::error!(
                path = %self.original.display(),
                "restored file does not match its content before extraction"
            ),
            Err(err) => tracing::error!(
                path = %self.original.display(),
                error = %err,
                "cannot verify restored file"
            ),
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(path = %path.display(), error = %err, "ignoring cleanup failure"),
    }
}

#[derive(Debug)]
struct InputFile {
    original: PathBuf,
    state: Option<RewriteState>,
}

/// Input files prepared for one resolution; restores every backup on drop.
#[derive(Debug, Default)]
pub struct Extraction {
    files: Vec<InputFile>,
}

impl Extraction {
    pub fn run(paths: &[PathBuf], rules: &PatternRules) -> anyhow::Result<Self> {
        let mut extraction = Extraction::default();
        let mut seen = HashSet::new();
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            let split = if rules.is_empty() {
                None
            } else {
                split_file(path, rules)?
            };
            let Some((kept, extracted, digest)) = split else {
                extraction.files.push(InputFile {
                    original: path.clone(),
                    state: None,
                });
                continue;
            };
            let state = RewriteState::new(path, extracted, digest);
            fs::rename(&state.original, &state.backup).with_context(|| {
                format!(
                    "move {} aside to {}",
                    state.original.display(),
                    state.backup.display()
                )
            })?;
            let rewritten = state.rewritten.clone();
            tracing::debug!(
                path = %path.display(),
                extracted = state.extracted.len(),
                "extracted passthrough lines"
            );
            extraction.files.push(InputFile {
                original: path.clone(),
                state: Some(state),
            });

            let body = kept.concat();
            fs::write(&rewritten, body).with_context(|| format!("write {}", rewritten.display()))?;
        }
        Ok(extraction)
    }

    /// Paths to hand to the resolver, in input order.
    pub fn resolver_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|f| match &f.state {
                Some(s) => s.rewritten.clone(),
                None => f.original.clone(),
            })
            .collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &RewriteState> {
        self.files.iter().filter_map(|f| f.state.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn is_rewritten(&self, original: &Path) -> bool {
        self.files
            .iter()
            .any(|f| f.original == original && f.state.is_some())
    }

    /// Fix provenance references in `output` and append the extracted lines.
    ///
    /// Block headers name each input relative to `base`, the manifest's directory.
    pub fn reinject(&self, output: &Path, base: &Path) -> anyhow::Result<()> {
        if self.states().next().is_none() {
            return Ok(());
        }
        let mut text =
            fs::read_to_string(output).with_context(|| format!("read {}", output.display()))?;
        for state in self.states() {
            let rewritten = file_name_of(&state.rewritten);
            if !rewritten.is_empty() {
                text = text.replace(&rewritten, &file_name_of(&state.original));
            }
        }
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&passthrough_blocks(self.states(), base));
        fs::write(output, text).with_context(|| format!("write {}", output.display()))?;
        for state in self.states() {
            remove_if_present(&state.rewritten);
        }
        Ok(())
    }
}

impl Drop for Extraction {
    fn drop(&mut self) {
        for file in self.files.iter().rev() {
            if let Some(state) = &file.state {
                state.restore();
            }
        }
    }
}

fn block_label(original: &Path, base: &Path) -> String {
    if let Ok(rel) = original.strip_prefix(base) {
        return rel.display().to_string();
    }
    if original.is_relative() {
        return original.display().to_string();
    }
    file_name_of(original)
}

fn passthrough_blocks<'a>(states: impl Iterator<Item = &'a RewriteState>, base: &Path) -> String {
    let mut out = String::new();
    for state in states {
        out.push_str(&format!(
            "# Passthrough dependencies from {}\n",
            block_label(&state.original, base)
        ));
        for line in &state.extracted {
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    out
}

type Split = (Vec<String>, Vec<String>, String);

fn split_file(path: &Path, rules: &PatternRules) -> anyhow::Result<Option<Split>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut kept = vec![];
    let mut extracted = vec![];
    for line in text.split_inclusive('\n') {
        if rules.first_match(line.trim_end_matches(['\r', '\n'])).is_some() {
            extracted.push(line.to_string());
        } else {
            kept.push(line.to_string());
        }
    }
    if extracted.is_empty() {
        return Ok(None);
    }
    Ok(Some((kept, extracted, sha256_hex(&bytes))))
}
