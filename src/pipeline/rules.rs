use anyhow::Context;
use regex::Regex;

/// Ordered regex rules; the first rule that matches a line wins.
#[derive(Debug, Clone, Default)]
pub struct PatternRules {
    rules: Vec<Regex>,
}

impl PatternRules {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).with_context(|| format!("invalid line pattern {:?}", p))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first rule matching `line`, in declaration order.
    pub fn first_match(&self, line: &str) -> Option<&Regex> {
        self.rules.iter().find(|r| r.is_match(line))
    }
}
