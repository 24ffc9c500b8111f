//! Key filters for ingress admission and dump requests.

use std::collections::BTreeSet;

use kestrel_proto::{FilterOperator, KeyDumpParams, VersionedValue};

/// A key-prefix / originator-id filter pair with an OR or AND combiner.
///
/// Empty filter sets match everything. Under OR a key matches if any prefix
/// or any originator matches; under AND each non-empty set must match.
#[derive(Debug, Clone)]
pub struct KeyFilters {
    prefixes: Vec<String>,
    originators: BTreeSet<String>,
    oper: FilterOperator,
}

impl KeyFilters {
    pub fn new(
        prefixes: Vec<String>,
        originators: BTreeSet<String>,
        oper: FilterOperator,
    ) -> Self {
        Self {
            prefixes,
            originators,
            oper,
        }
    }

    /// A filter that matches every record.
    pub fn match_all() -> Self {
        Self::new(Vec::new(), BTreeSet::new(), FilterOperator::Or)
    }

    /// Build from dump params. The `keys` prefix list takes precedence over
    /// the deprecated comma-joined `prefix` string.
    pub fn from_dump_params(params: &KeyDumpParams) -> Self {
        let prefixes = match &params.keys {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => params
                .prefix
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        };
        Self::new(
            prefixes,
            params.originator_ids.clone(),
            params.oper.unwrap_or(FilterOperator::Or),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.originators.is_empty()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn originators(&self) -> &BTreeSet<String> {
        &self.originators
    }

    fn prefix_match(&self, key: &str) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Whether `(key, value)` passes the filter.
    pub fn matches(&self, key: &str, value: &VersionedValue) -> bool {
        if self.is_empty() {
            return true;
        }
        let originator_match = self.originators.contains(&value.originator_id);
        match self.oper {
            FilterOperator::Or => self.prefix_match(key) || originator_match,
            FilterOperator::And => {
                (self.prefixes.is_empty() || self.prefix_match(key))
                    && (self.originators.is_empty() || originator_match)
            }
        }
    }

    /// Prefix-only match, used for hash dumps where originators are ignored.
    pub fn matches_key(&self, key: &str) -> bool {
        self.prefixes.is_empty() || self.prefix_match(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_from(originator: &str) -> VersionedValue {
        VersionedValue::new(1, originator, Some(b"v".to_vec()), 1000)
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let f = KeyFilters::match_all();
        assert!(f.matches("anything", &value_from("anyone")));
    }

    #[test]
    fn test_or_matches_either_set() {
        let f = KeyFilters::new(
            vec!["adj:".into()],
            ["node-a".to_string()].into_iter().collect(),
            FilterOperator::Or,
        );
        assert!(f.matches("adj:node-z", &value_from("node-z")));
        assert!(f.matches("prefix:x", &value_from("node-a")));
        assert!(!f.matches("prefix:x", &value_from("node-z")));
    }

    #[test]
    fn test_and_requires_both_sets() {
        let f = KeyFilters::new(
            vec!["adj:".into()],
            ["node-a".to_string()].into_iter().collect(),
            FilterOperator::And,
        );
        assert!(f.matches("adj:x", &value_from("node-a")));
        assert!(!f.matches("adj:x", &value_from("node-b")));
        assert!(!f.matches("prefix:x", &value_from("node-a")));
    }

    #[test]
    fn test_and_with_single_set_ignores_empty_side() {
        let f = KeyFilters::new(vec!["adj:".into()], BTreeSet::new(), FilterOperator::And);
        assert!(f.matches("adj:x", &value_from("anyone")));
        assert!(!f.matches("prefix:x", &value_from("anyone")));
    }

    #[test]
    fn test_from_dump_params_list_takes_precedence() {
        let params = KeyDumpParams {
            prefix: "legacy:".into(),
            keys: Some(vec!["adj:".into()]),
            ..Default::default()
        };
        let f = KeyFilters::from_dump_params(&params);
        assert_eq!(f.prefixes(), &["adj:".to_string()]);
    }

    #[test]
    fn test_from_dump_params_legacy_comma_string() {
        let params = KeyDumpParams {
            prefix: "adj:,prefix:".into(),
            ..Default::default()
        };
        let f = KeyFilters::from_dump_params(&params);
        assert_eq!(f.prefixes().len(), 2);
        assert!(f.matches_key("prefix:node-a"));
        assert!(!f.matches_key("cfg:x"));
    }

    #[test]
    fn test_from_dump_params_empty_list_falls_back() {
        let params = KeyDumpParams {
            prefix: "adj:".into(),
            keys: Some(vec![]),
            ..Default::default()
        };
        let f = KeyFilters::from_dump_params(&params);
        assert_eq!(f.prefixes(), &["adj:".to_string()]);
    }
}
