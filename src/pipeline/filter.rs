// Purpose: Comment out resolved lines that match removal patterns, keeping an audit trail.
// Inputs/Outputs: Pinned file text + PatternRules -> rewritten text with excluded lines commented.
// Invariants: Unmatched lines pass through byte-for-byte; a matched line becomes exactly two lines.
// Gotchas: Output is joined with the host line ending, whatever the resolver produced.

use anyhow::Context;
use std::fs;
use std::path::Path;

use crate::pipeline::rules::PatternRules;

#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

pub fn filter_lines(text: &str, rules: &PatternRules) -> String {
    let mut lines = Vec::<String>::new();
    for line in text.lines() {
        match rules.first_match(line) {
            Some(rule) => {
                lines.push(format!(
                    "# Removed by crosspin because it matched the pattern {:?}",
                    rule.as_str()
                ));
                lines.push(format!("# {}", line));
            }
            None => lines.push(line.to_string()),
        }
    }
    let mut out = lines.join(LINE_ENDING);
    if text.ends_with('\n') {
        out.push_str(LINE_ENDING);
    }
    out
}

pub fn filter_file(path: &Path, rules: &PatternRules) -> anyhow::Result<()> {
    if rules.is_empty() {
        return Ok(());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    fs::write(path, filter_lines(&text, rules)).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
