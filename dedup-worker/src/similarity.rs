//! Deciding which search hits are worth recording as suspected duplicates.
use chrono::Utc;
use dedup_common::event::CustomerRecord;
use dedup_common::suspicion::{FieldComparison, SimilarityDetails, SuspicionRecord};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::search::CandidateHit;

/// Hits must score strictly above this to be considered.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 4.0;

/// Original value for a highlighted field the source record has no counterpart for.
pub const NOT_APPLICABLE: &str = "N/A";

const EMAIL_FIELD: &str = "email";
const USERNAME_PREFIX_LEN: usize = 3;

/// Whether two addresses plausibly belong to the same person, judging by the part before `@`.
///
/// Local parts are compared case-insensitively. When both are at least three characters long
/// they must share their first three characters. Shorter, non-identical local parts are
/// accepted.
pub fn username_similar(email_a: &str, email_b: &str) -> bool {
    let (Some((user_a, _)), Some((user_b, _))) = (email_a.split_once('@'), email_b.split_once('@'))
    else {
        return false;
    };

    let user_a = user_a.to_lowercase();
    let user_b = user_b.to_lowercase();

    if user_a.is_empty() || user_b.is_empty() {
        return false;
    }

    if user_a == user_b {
        return true;
    }

    let prefix_a: Vec<char> = user_a.chars().take(USERNAME_PREFIX_LEN).collect();
    let prefix_b: Vec<char> = user_b.chars().take(USERNAME_PREFIX_LEN).collect();

    if prefix_a.len() == USERNAME_PREFIX_LEN && prefix_b.len() == USERNAME_PREFIX_LEN {
        return prefix_a == prefix_b;
    }

    true
}

/// Value on the source record that corresponds to an index field name.
pub fn source_value_for_field<'a>(record: &'a CustomerRecord, field: &str) -> &'a str {
    match field.to_lowercase().as_str() {
        "nome" => &record.full_name,
        "email" => &record.email,
        "documento" => &record.document_number,
        "telefone" | "telefone.keyword" => &record.phone,
        _ => NOT_APPLICABLE,
    }
}

pub struct SimilarityEvaluator {
    threshold: f64,
}

impl Default for SimilarityEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_SCORE_THRESHOLD)
    }
}

impl SimilarityEvaluator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Build the field-by-field evidence for a hit, before any filtering.
    pub fn compare_fields(
        &self,
        source: &CustomerRecord,
        hit: &CandidateHit,
    ) -> Vec<FieldComparison> {
        hit.matched_fields
            .iter()
            .map(|(field, fragments)| FieldComparison {
                field: field.clone(),
                original_value: source_value_for_field(source, field).to_owned(),
                found_value: fragments.join(", "),
                field_score: hit.relevance_score,
            })
            .collect()
    }

    /// Turn a hit into a suspicion, or `None` when it is not convincing enough.
    pub fn evaluate(
        &self,
        event_id: Uuid,
        source: &CustomerRecord,
        hit: &CandidateHit,
    ) -> Option<SuspicionRecord> {
        if hit.relevance_score <= self.threshold {
            debug!(
                candidate_id = %hit.candidate_id,
                score = hit.relevance_score,
                "hit below threshold"
            );
            return None;
        }

        let mut comparisons = self.compare_fields(source, hit);

        if !username_similar(&source.email, &hit.email) {
            comparisons.retain(|comparison| !comparison.field.eq_ignore_ascii_case(EMAIL_FIELD));
        }

        if comparisons.is_empty() {
            debug!(candidate_id = %hit.candidate_id, "no comparable fields left");
            return None;
        }

        let details = SimilarityDetails {
            summary: format!(
                "Comparison between new record ({}) and existing record ({})",
                source.full_name, hit.full_name
            ),
            comparisons,
            global_score: hit.relevance_score,
        };

        match SuspicionRecord::new(
            event_id,
            source.customer_id,
            hit.candidate_id,
            hit.relevance_score,
            details,
            Utc::now(),
        ) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(candidate_id = %hit.candidate_id, "discarding hit: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dedup_common::event::CustomerType;
    use indexmap::IndexMap;

    use super::*;

    fn source() -> CustomerRecord {
        CustomerRecord {
            customer_id: Uuid::new_v4(),
            customer_type: CustomerType::Individual,
            document_number: "123".to_owned(),
            full_name: "João Silva".to_owned(),
            phone: "555".to_owned(),
            email: "joao@x.com".to_owned(),
        }
    }

    fn hit(score: f64, email: &str, fields: Vec<(&str, Vec<&str>)>) -> CandidateHit {
        CandidateHit {
            candidate_id: Uuid::new_v4(),
            full_name: "João Silva".to_owned(),
            document_number: "123".to_owned(),
            phone: "555".to_owned(),
            email: email.to_owned(),
            customer_type: CustomerType::Individual,
            relevance_score: score,
            matched_fields: fields
                .into_iter()
                .map(|(field, fragments)| {
                    (
                        field.to_owned(),
                        fragments.into_iter().map(str::to_owned).collect(),
                    )
                })
                .collect::<IndexMap<_, _>>(),
        }
    }

    #[test]
    fn test_username_similar_truth_table() {
        assert!(username_similar("joao@x.com", "joao@y.com"));
        assert!(!username_similar("joa@x.com", "joe@y.com"));
        assert!(username_similar("jo@x.com", "jo@y.com"));
        assert!(username_similar("ze@x.com", "al@y.com"));
        assert!(username_similar("joao@x.com", "joaox@y.com"));
        assert!(username_similar("JOAO@x.com", "joao@y.com"));
        assert!(!username_similar("joao.silva@x.com", "maria@x.com"));
    }

    #[test]
    fn test_username_similar_rejects_unusable_addresses() {
        assert!(!username_similar("", "joao@y.com"));
        assert!(!username_similar("joao@x.com", ""));
        assert!(!username_similar("joao", "joao@y.com"));
        assert!(!username_similar("@x.com", "@y.com"));
    }

    #[test]
    fn test_username_prefix_counts_characters() {
        assert!(username_similar("joão@x.com", "joãozinho@y.com"));
        assert!(!username_similar("joão@x.com", "joao@y.com"));
    }

    #[test]
    fn test_source_value_for_field() {
        let record = source();

        assert_eq!(source_value_for_field(&record, "Nome"), "João Silva");
        assert_eq!(source_value_for_field(&record, "EMAIL"), "joao@x.com");
        assert_eq!(source_value_for_field(&record, "documento"), "123");
        assert_eq!(source_value_for_field(&record, "telefone"), "555");
        assert_eq!(source_value_for_field(&record, "telefone.keyword"), "555");
        assert_eq!(source_value_for_field(&record, "endereco"), NOT_APPLICABLE);
    }

    #[test]
    fn test_threshold_is_strict() {
        let evaluator = SimilarityEvaluator::default();
        let record = source();

        for score in [0.0, 3.9, 4.0] {
            let candidate = hit(score, "joao@x.com", vec![("nome", vec!["João Silva"])]);
            assert!(evaluator.evaluate(Uuid::new_v4(), &record, &candidate).is_none());
        }

        let candidate = hit(4.01, "joao@x.com", vec![("nome", vec!["João Silva"])]);
        assert!(evaluator.evaluate(Uuid::new_v4(), &record, &candidate).is_some());
    }

    #[test]
    fn test_builds_comparisons_from_highlights() {
        let evaluator = SimilarityEvaluator::default();
        let record = source();
        let candidate = hit(
            5.0,
            "joao.silva@x.com",
            vec![
                ("nome", vec!["João", "Silva"]),
                ("documento", vec!["123"]),
                ("endereco", vec!["Rua A"]),
            ],
        );

        let suspicion = evaluator
            .evaluate(Uuid::new_v4(), &record, &candidate)
            .unwrap();

        assert_eq!(suspicion.original_id, record.customer_id);
        assert_eq!(suspicion.suspect_id, candidate.candidate_id);
        assert_eq!(suspicion.score, 5.0);
        assert_eq!(suspicion.similarity_details.global_score, 5.0);
        assert_eq!(
            suspicion.similarity_details.summary,
            "Comparison between new record (João Silva) and existing record (João Silva)"
        );
        assert_eq!(
            suspicion.similarity_details.comparisons,
            vec![
                FieldComparison {
                    field: "nome".to_owned(),
                    original_value: "João Silva".to_owned(),
                    found_value: "João, Silva".to_owned(),
                    field_score: 5.0,
                },
                FieldComparison {
                    field: "documento".to_owned(),
                    original_value: "123".to_owned(),
                    found_value: "123".to_owned(),
                    field_score: 5.0,
                },
                FieldComparison {
                    field: "endereco".to_owned(),
                    original_value: NOT_APPLICABLE.to_owned(),
                    found_value: "Rua A".to_owned(),
                    field_score: 5.0,
                },
            ]
        );
    }

    #[test]
    fn test_dissimilar_usernames_drop_the_email_comparison() {
        let evaluator = SimilarityEvaluator::default();
        let record = source();
        let candidate = hit(
            6.0,
            "maria@x.com",
            vec![("Email", vec!["maria"]), ("nome", vec!["João Silva"])],
        );

        let suspicion = evaluator
            .evaluate(Uuid::new_v4(), &record, &candidate)
            .unwrap();

        let fields: Vec<_> = suspicion
            .similarity_details
            .comparisons
            .iter()
            .map(|c| c.field.as_str())
            .collect();
        assert_eq!(fields, vec!["nome"]);
    }

    #[test]
    fn test_only_email_and_dissimilar_yields_nothing() {
        let evaluator = SimilarityEvaluator::default();
        let record = source();
        let candidate = hit(6.0, "maria@x.com", vec![("email", vec!["maria"])]);

        assert!(evaluator.evaluate(Uuid::new_v4(), &record, &candidate).is_none());
    }

    #[test]
    fn test_no_highlights_yields_nothing() {
        let evaluator = SimilarityEvaluator::default();
        let candidate = hit(9.0, "joao@x.com", vec![]);

        assert!(evaluator
            .evaluate(Uuid::new_v4(), &source(), &candidate)
            .is_none());
    }

    #[test]
    fn test_self_match_yields_nothing() {
        let evaluator = SimilarityEvaluator::default();
        let record = source();
        let mut candidate = hit(9.0, "joao@x.com", vec![("nome", vec!["João Silva"])]);
        candidate.candidate_id = record.customer_id;

        assert!(evaluator.evaluate(Uuid::new_v4(), &record, &candidate).is_none());
    }
}
