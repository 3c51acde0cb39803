use std::env;
use std::process::Command;

// Embeds the source revision so `crosspin --version` identifies the build that wrote a pin file.
fn main() {
    println!("cargo:rerun-if-env-changed=CROSSPIN_GIT_COMMIT");

    let commit = env::var("CROSSPIN_GIT_COMMIT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(describe_head);
    if let Some(commit) = commit {
        println!("cargo:rustc-env=CROSSPIN_GIT_COMMIT={commit}");
    }
}

fn describe_head() -> Option<String> {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    let out = Command::new("git")
        .args(["describe", "--always", "--abbrev=12", "--dirty=-dirty", "--exclude=*"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}
