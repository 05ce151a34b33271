//! Provenance URI construction.
//!
//! `repro://<post-state>@<dataset-id>/<record-id>?<params>`. The URI is
//! opaque metadata attached to content keys; nothing here dereferences it.

use std::collections::BTreeSet;

use url::form_urlencoded;

use crate::core::invariants::InvariantViolation;
use crate::core::types::{RepoState, SubstitutionTable};

pub const REPRO_SCHEME: &str = "repro";

/// Build the provenance URI for one recorded run.
///
/// Parameters are emitted in key order; multi-valued parameters become
/// repeated query keys in value order, so equal inputs give byte-identical
/// output.
pub fn build_repro_url(
    dataset_id: &str,
    post_state: &RepoState,
    record_id: &str,
    params: &SubstitutionTable,
) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        for v in value.values() {
            query.append_pair(name, v);
        }
    }
    format!(
        "{REPRO_SCHEME}://{post_state}@{dataset_id}/{record_id}?{}",
        query.finish()
    )
}

/// Restrict `table` to the `required` names.
///
/// Every required name must be present.
pub fn select_parameters(
    required: &BTreeSet<String>,
    table: &SubstitutionTable,
) -> Result<SubstitutionTable, InvariantViolation> {
    required
        .iter()
        .map(|name| {
            table
                .get(name)
                .map(|value| (name.clone(), value.clone()))
                .ok_or_else(|| InvariantViolation::MissingSubstitution { name: name.clone() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ParamValue;

    fn params() -> SubstitutionTable {
        let mut table = SubstitutionTable::new();
        table.insert(
            "b".to_string(),
            ParamValue::Many(vec!["2".to_string(), "3".to_string()]),
        );
        table.insert("a".to_string(), ParamValue::from("1"));
        table
    }

    #[test]
    fn url_has_fixed_shape_and_sorted_repeated_query() {
        let url = build_repro_url("ds-1", &RepoState::new("abc123"), "rec", &params());
        assert_eq!(url, "repro://abc123@ds-1/rec?a=1&b=2&b=3");
    }

    #[test]
    fn url_is_deterministic_for_equal_maps() {
        let state = RepoState::new("abc123");
        let first = build_repro_url("ds", &state, "rec", &params());
        let second = build_repro_url("ds", &state, "rec", &params());
        assert_eq!(first, second);
    }

    #[test]
    fn query_values_are_escaped() {
        let mut table = SubstitutionTable::new();
        table.insert("path".to_string(), ParamValue::from("a b/c&d=é"));
        let url = build_repro_url("ds", &RepoState::new("s"), "r", &table);
        assert_eq!(url, "repro://s@ds/r?path=a+b%2Fc%26d%3D%C3%A9");
    }

    #[test]
    fn empty_params_leave_empty_query() {
        let url = build_repro_url("ds", &RepoState::new("s"), "r", &SubstitutionTable::new());
        assert_eq!(url, "repro://s@ds/r?");
    }

    #[test]
    fn select_parameters_keeps_only_required() {
        let required: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let selected = select_parameters(&required, &params()).expect("select");
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("a"));
    }

    #[test]
    fn select_parameters_reports_missing_name() {
        let required: BTreeSet<String> = ["zzz".to_string()].into_iter().collect();
        assert_eq!(
            select_parameters(&required, &params()),
            Err(InvariantViolation::MissingSubstitution {
                name: "zzz".to_string()
            })
        );
    }
}
