//! Glob matching for pool selection criteria.
use glob::Pattern;

/// What a request looks like to pool selection. Values come from option 82
/// sub-options and options 60/77; absent values stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    pub circuit_id: String,
    pub remote_id: String,
    pub vendor_class: String,
    pub user_class: String,
}

/// Optional glob patterns attached to a pool. A pool with at least one
/// pattern is "specific" and only matches when every non-empty pattern
/// matches its criterion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPatterns {
    pub circuit_id: Option<String>,
    pub remote_id: Option<String>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
}

impl MatchPatterns {
    pub fn is_specific(&self) -> bool {
        self.circuit_id.is_some()
            || self.remote_id.is_some()
            || self.vendor_class.is_some()
            || self.user_class.is_some()
    }

    pub fn matches(&self, criteria: &MatchCriteria) -> bool {
        let pairs = [
            (&self.circuit_id, &criteria.circuit_id),
            (&self.remote_id, &criteria.remote_id),
            (&self.vendor_class, &criteria.vendor_class),
            (&self.user_class, &criteria.user_class),
        ];
        pairs.into_iter().all(|(pattern, value)| match pattern {
            Some(p) => match_value(p, value),
            None => true,
        })
    }
}

/// Glob match with `*`, `?` and `[...]`. A pattern that doesn't compile
/// falls back to prefix matching when it ends with `*`, else exact
/// comparison. An empty value never satisfies a pattern.
pub fn match_value(pattern: &str, value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => match pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => pattern == value,
        },
    }
}
