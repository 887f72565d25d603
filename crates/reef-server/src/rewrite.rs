use regex::Regex;

/// One URL rewrite rule. Replacement strings may reference capture
/// groups (`$1`).
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub pattern: Regex,
    pub replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }
}

/// Applies an ordered rule list: the first matching rule rewrites the
/// path and wins; unmatched input passes through unchanged.
pub fn apply_rewrite_rules(path: &str, rules: &[RewriteRule]) -> String {
    for rule in rules {
        if rule.pattern.is_match(path) {
            return rule
                .pattern
                .replace(path, rule.replacement.as_str())
                .into_owned();
        }
    }
    path.to_string()
}
