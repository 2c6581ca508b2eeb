//! Equality-based label selectors.

use std::collections::BTreeMap;
use std::fmt;

/// A conjunction of `key=value` requirements.
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a `key=value` requirement.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|(k, v)| {
            labels
                .and_then(|labels| labels.get(k))
                .is_some_and(|actual| actual == v)
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let labels: BTreeMap<String, String> = [("app", "x"), ("tier", "web")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert!(LabelSelector::everything().matches(None));
        assert!(LabelSelector::everything().eq("app", "x").matches(Some(&labels)));
        assert!(!LabelSelector::everything().eq("app", "y").matches(Some(&labels)));
        assert!(!LabelSelector::everything().eq("app", "x").matches(None));
    }

    #[test]
    fn test_display_is_sorted() {
        let selector = LabelSelector::everything().eq("b", "2").eq("a", "1");
        assert_eq!(selector.to_string(), "a=1,b=2");
    }
}
