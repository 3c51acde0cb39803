// Purpose: Line-level file transformations around a resolution: passthrough extraction,
//          reinjection, and output filtering.
// Inputs/Outputs: Input manifests before resolution, the pinned file after it.
// Invariants: Rule lists are ordered and first-match-wins everywhere.
// Gotchas: Reinjection runs before filtering, so removal rules also see passthrough lines.

pub mod filter;
pub mod passthrough;
pub mod rules;

pub use filter::filter_file;
pub use passthrough::{Extraction, RewriteState};
pub use rules::PatternRules;
