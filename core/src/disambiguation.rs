use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{FieldSpec, Shape};
use crate::validate::{FailureKind, ValidationFailure, validate};

/// Field name used when validating a numbered selection.
pub const SELECTION_FIELD: &str = "selection";

/// One numbered search match shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisambiguationCandidate {
    pub ordinal: usize,
    pub display_label: String,
    pub record_id: String,
}

/// Result of looking at an identification search.
#[derive(Debug, Clone, PartialEq)]
pub enum Disambiguation {
    NoMatches,
    /// Exactly one match; no question needed.
    Single {
        candidate: DisambiguationCandidate,
        record: Value,
    },
    Multiple {
        candidates: Vec<DisambiguationCandidate>,
    },
}

/// Number the records in search order. Records without a logical id cannot be
/// selected and are skipped.
pub fn build_disambiguation(resource_type: &str, records: &[Value]) -> Disambiguation {
    let identified: Vec<&Value> = records.iter().filter(|r| record_id(r).is_some()).collect();
    let candidates: Vec<DisambiguationCandidate> = identified
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            Some(DisambiguationCandidate {
                ordinal: index + 1,
                display_label: display_label(resource_type, record),
                record_id: record_id(record)?.to_string(),
            })
        })
        .collect();

    match (candidates.len(), identified.first()) {
        (0, _) => Disambiguation::NoMatches,
        (1, Some(record)) => Disambiguation::Single {
            candidate: candidates[0].clone(),
            record: (*record).clone(),
        },
        _ => Disambiguation::Multiple { candidates },
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

/// Human-readable label, chosen by the record's own `resourceType` when present.
pub fn display_label(resource_type: &str, record: &Value) -> String {
    let kind = record
        .get("resourceType")
        .and_then(Value::as_str)
        .unwrap_or(resource_type);
    let id = record_id(record).unwrap_or("unknown");

    match kind {
        "Patient" => {
            let (family, given) = human_name(record);
            let birth_date = record
                .get("birthDate")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("{family}, {given} (birthDate: {birth_date}, id: {id})")
        }
        "Practitioner" | "RelatedPerson" => {
            let (family, given) = human_name(record);
            format!("{family}, {given} (id: {id})")
        }
        "Organization" | "Location" => {
            let name = record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            format!("{name} (id: {id})")
        }
        _ => format!("id: {id}"),
    }
}

/// Family and given names from the first `HumanName`, `Unknown` when absent.
fn human_name(record: &Value) -> (String, String) {
    let name = record
        .get("name")
        .and_then(Value::as_array)
        .and_then(|names| names.first());
    let family = name
        .and_then(|n| n.get("family"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Unknown")
        .to_string();
    let given = name
        .and_then(|n| n.get("given"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    (family, given)
}

/// `1. label` lines in ordinal order.
pub fn render_list(candidates: &[DisambiguationCandidate]) -> String {
    candidates
        .iter()
        .map(|c| format!("{}. {}", c.ordinal, c.display_label))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Numeric field accepting `1..=count`, validated like any other field.
pub fn selection_spec(count: usize) -> FieldSpec {
    let mut spec = FieldSpec::new(
        SELECTION_FIELD,
        Shape::Number,
        "Number of the matching record",
    )
    .required()
    .range(Some(1.0), Some(count as f64));
    spec.examples = (1..=count.min(3)).map(|n| n.to_string()).collect();
    spec
}

/// Map a numbered answer back to its candidate by index.
pub fn resolve_selection<'c>(
    candidates: &'c [DisambiguationCandidate],
    raw: &str,
) -> Result<&'c DisambiguationCandidate, ValidationFailure> {
    let spec = selection_spec(candidates.len());
    let value = validate(raw, &spec)?;
    let ordinal = value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ValidationFailure {
            field: SELECTION_FIELD.to_string(),
            kind: FailureKind::Parse,
            message: "Value must be a whole number.".to_string(),
        })?;
    candidates.get(ordinal - 1).ok_or_else(|| ValidationFailure {
        field: SELECTION_FIELD.to_string(),
        kind: FailureKind::Range,
        message: format!("Value must be at most {}.", candidates.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patients() -> Vec<Value> {
        vec![
            json!({ "resourceType": "Patient", "id": "p1", "birthDate": "1980-01-01",
                    "name": [{ "family": "Smith", "given": ["John"] }] }),
            json!({ "resourceType": "Patient", "id": "p2", "birthDate": "1975-05-05",
                    "name": [{ "family": "Smith", "given": ["Jane", "Q"] }] }),
            json!({ "resourceType": "Patient", "id": "p3" }),
        ]
    }

    fn candidates() -> Vec<DisambiguationCandidate> {
        match build_disambiguation("Patient", &patients()) {
            Disambiguation::Multiple { candidates } => candidates,
            other => panic!("expected multiple matches, got {other:?}"),
        }
    }

    #[test]
    fn zero_one_and_many_records() {
        assert_eq!(build_disambiguation("Patient", &[]), Disambiguation::NoMatches);

        let single = build_disambiguation("Patient", &patients()[..1]);
        match single {
            Disambiguation::Single { candidate, record } => {
                assert_eq!(candidate.record_id, "p1");
                assert_eq!(record["id"], "p1");
            }
            other => panic!("expected single match, got {other:?}"),
        }

        assert_eq!(candidates().len(), 3);
    }

    #[test]
    fn candidates_keep_search_order_and_patient_labels() {
        let candidates = candidates();
        assert_eq!(candidates[0].ordinal, 1);
        assert_eq!(
            candidates[0].display_label,
            "Smith, John (birthDate: 1980-01-01, id: p1)"
        );
        assert_eq!(
            candidates[1].display_label,
            "Smith, Jane Q (birthDate: 1975-05-05, id: p2)"
        );
        assert_eq!(
            candidates[2].display_label,
            "Unknown, Unknown (birthDate: unknown, id: p3)"
        );
        assert_eq!(
            render_list(&candidates[..2]),
            "1. Smith, John (birthDate: 1980-01-01, id: p1)\n2. Smith, Jane Q (birthDate: 1975-05-05, id: p2)"
        );
    }

    #[test]
    fn unrecognized_kind_uses_generic_label() {
        let label = display_label("Device", &json!({ "resourceType": "Device", "id": "d9" }));
        assert_eq!(label, "id: d9");
        let label = display_label("Organization", &json!({ "id": "o1", "name": "Acme" }));
        assert_eq!(label, "Acme (id: o1)");
    }

    #[test]
    fn records_without_id_are_not_selectable() {
        let records = vec![json!({ "resourceType": "Patient" }), patients()[1].clone()];
        match build_disambiguation("Patient", &records) {
            Disambiguation::Single { candidate, .. } => assert_eq!(candidate.record_id, "p2"),
            other => panic!("expected single match, got {other:?}"),
        }
    }

    #[test]
    fn selection_maps_ordinal_to_record_id() {
        let candidates = candidates();
        assert_eq!(resolve_selection(&candidates, "2").unwrap().record_id, "p2");
        assert_eq!(resolve_selection(&candidates, " 3 ").unwrap().record_id, "p3");
    }

    #[test]
    fn selection_outside_range_is_rejected() {
        let candidates = candidates();
        for raw in ["0", "4", "-1"] {
            let err = resolve_selection(&candidates, raw).unwrap_err();
            assert_eq!(err.kind, FailureKind::Range, "{raw}");
        }
        assert_eq!(
            resolve_selection(&candidates, "4").unwrap_err().message,
            "Value must be at most 3."
        );
        let err = resolve_selection(&candidates, "two").unwrap_err();
        assert_eq!(err.message, "Value must be a valid number.");
        let err = resolve_selection(&candidates, "1.5").unwrap_err();
        assert_eq!(err.message, "Value must be a whole number.");
    }

    #[test]
    fn selection_spec_constrains_one_to_n() {
        let spec = selection_spec(3);
        assert_eq!(spec.shape, Shape::Number);
        assert!(spec.is_required());
        assert_eq!(spec.constraints.minimum, Some(1.0));
        assert_eq!(spec.constraints.maximum, Some(3.0));
        assert_eq!(spec.examples, vec!["1", "2", "3"]);
    }
}
