use serde::{Deserialize, Serialize};

/// One literal find/replace step applied to a page URL before it is used as an identifier.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

impl RewriteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Apply `rules` to `raw_url` in order. Each rule replaces every occurrence in the output of
/// the previous rule. No URL parsing happens here; malformed input passes through untouched.
pub fn resolve(raw_url: &str, rules: &[RewriteRule]) -> String {
    let mut current = raw_url.to_string();
    for rule in rules {
        // An empty needle would match between every character.
        if rule.from.is_empty() {
            continue;
        }
        if current.contains(&rule.from) {
            current = current.replace(&rule.from, &rule.to);
        }
    }
    current
}

/// Pair up parallel `from`/`to` lists. Missing replacements become the empty string, so a
/// `from` entry without a partner deletes its match.
pub fn rules_from_parallel(from: &[String], to: &[String]) -> Vec<RewriteRule> {
    from.iter()
        .enumerate()
        .map(|(index, needle)| RewriteRule {
            from: needle.clone(),
            to: to.get(index).cloned().unwrap_or_default(),
        })
        .collect()
}
