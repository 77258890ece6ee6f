//! Candidate retrieval against the customer search index.
use std::time;

use async_trait::async_trait;
use dedup_common::event::{CustomerRecord, CustomerType};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RetrievalError;

/// An existing customer the search backend considers similar to the one being analyzed.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateHit {
    pub candidate_id: Uuid,
    pub full_name: String,
    pub document_number: String,
    pub phone: String,
    pub email: String,
    pub customer_type: CustomerType,
    pub relevance_score: f64,
    /// Highlighted fragments per index field, in the order the backend returned them.
    pub matched_fields: IndexMap<String, Vec<String>>,
}

/// Anything that can list customers resembling a record.
#[async_trait]
pub trait CandidateSource {
    async fn find_candidates(
        &self,
        record: &CustomerRecord,
    ) -> Result<Vec<CandidateHit>, RetrievalError>;
}

/// Text before the first `@`, or the whole address when there is none.
pub fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or_default()
}

/// Build the similarity query for `record`.
///
/// Clauses for empty fields are left out. Returns `None` when nothing is left to search on.
pub fn build_query(record: &CustomerRecord, size: u32) -> Option<Value> {
    let mut should = Vec::new();

    if !record.full_name.is_empty() {
        should.push(json!({
            "match": { "nome": { "query": record.full_name, "fuzziness": "AUTO" } }
        }));
    }

    if !record.document_number.is_empty() {
        should.push(json!({
            "match": { "documento": { "query": record.document_number } }
        }));
    }

    let local_part = email_local_part(&record.email);
    if !local_part.is_empty() {
        should.push(json!({
            "match": {
                "email": {
                    "query": local_part,
                    "fuzziness": "AUTO",
                    "prefix_length": 3,
                    "boost": 1.5
                }
            }
        }));
    }

    if !record.phone.is_empty() {
        should.push(json!({
            "term": { "telefone.keyword": { "value": record.phone, "boost": 2.0 } }
        }));
    }

    if should.is_empty() {
        return None;
    }

    Some(json!({
        "size": size,
        "query": {
            "bool": {
                "should": should,
                "must_not": [
                    { "term": { "id": record.customer_id.to_string() } }
                ]
            }
        },
        "highlight": {
            "pre_tags": [""],
            "post_tags": [""],
            "fields": {
                "nome": {},
                "email": {},
                "documento": {},
                "telefone.keyword": {}
            }
        }
    }))
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: Option<IndexedCustomer>,
    #[serde(default)]
    highlight: IndexMap<String, Vec<String>>,
}

/// Document shape of the customer index.
#[derive(Debug, Deserialize)]
struct IndexedCustomer {
    id: Option<String>,
    #[serde(default)]
    nome: String,
    #[serde(default)]
    documento: String,
    #[serde(default)]
    telefone: String,
    #[serde(default)]
    email: String,
    #[serde(rename = "tipoCliente", default)]
    tipo_cliente: CustomerType,
}

impl RawHit {
    fn into_candidate(self) -> Option<CandidateHit> {
        let Some(source) = self.source else {
            warn!(hit_id = ?self.id, "search hit without a source document, skipping");
            return None;
        };

        let raw_id = source.id.as_deref().or(self.id.as_deref()).unwrap_or_default();
        let candidate_id = match Uuid::parse_str(raw_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(raw_id, "search hit without a usable customer id, skipping: {}", e);
                return None;
            }
        };

        Some(CandidateHit {
            candidate_id,
            full_name: source.nome,
            document_number: source.documento,
            phone: source.telefone,
            email: source.email,
            customer_type: source.tipo_cliente,
            relevance_score: self.score.unwrap_or_default(),
            matched_fields: self.highlight,
        })
    }
}

/// `CandidateSource` backed by an Elasticsearch index, spoken to over its REST API.
pub struct ElasticsearchCandidates {
    client: reqwest::Client,
    search_url: String,
    max_hits: u32,
}

impl ElasticsearchCandidates {
    pub fn new(
        base_url: &str,
        index: &str,
        max_hits: u32,
        request_timeout: time::Duration,
    ) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .user_agent("DedupWorker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            search_url: format!("{}/{}/_search", base_url.trim_end_matches('/'), index),
            max_hits,
        })
    }
}

#[async_trait]
impl CandidateSource for ElasticsearchCandidates {
    async fn find_candidates(
        &self,
        record: &CustomerRecord,
    ) -> Result<Vec<CandidateHit>, RetrievalError> {
        let Some(query) = build_query(record, self.max_hits) else {
            debug!(customer_id = %record.customer_id, "nothing to search on");
            return Ok(Vec::new());
        };

        let response = self.client.post(&self.search_url).json(&query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::UnsuccessfulResponse { status, body });
        }

        let body = response.bytes().await?;
        let parsed: SearchResponse = serde_json::from_slice(&body)
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .hits
            .hits
            .into_iter()
            .filter_map(RawHit::into_candidate)
            .collect())
    }
}
