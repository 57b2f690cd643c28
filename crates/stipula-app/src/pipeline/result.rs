//! Structured representation of contract clauses extracted from document text.
//!
//! These data types model the contract we expect from the structured
//! extraction stage. They stay pure, provide JSON schema generation for
//! prompting, and expose validation so downstream code can refuse malformed
//! payloads before writing to storage.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Canonical structured payload for a single contract extraction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClauseExtraction {
    pub parties: Parties,
    pub dates: ContractDates,
    pub clauses: Clauses,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ClauseExtraction {
    /// Generate a JSON schema describing this payload.
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(ClauseExtraction);
        serde_json::to_value(&schema).expect("schema is serializable")
    }

    /// Validate semantic constraints beyond plain JSON typing.
    pub fn validate(&self) -> Result<(), ExtractionValidationError> {
        let mut issues = Vec::new();

        if !self.confidence.is_finite() {
            issues.push("confidence must be a finite number".to_string());
        } else if !(0.0..=1.0).contains(&self.confidence) {
            issues.push(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ExtractionValidationError { issues })
        }
    }
}

/// Contracting parties named in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Parties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_one: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_two: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_parties: Vec<String>,
}

/// Key contract dates. Free-form strings: the prompt asks for ISO dates but
/// `term_length` is inherently prose ("5 years").
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContractDates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_length: Option<String>,
}

/// Extracted clause text, one optional field per clause family.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Clauses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governing_law: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidentiality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indemnification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitation_of_liability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intellectual_property: Option<String>,
}

/// Validation failures aggregated into a single error.
#[derive(Debug, Error)]
#[error("extraction validation failed: {issues:?}")]
pub struct ExtractionValidationError {
    pub issues: Vec<String>,
}

impl ExtractionValidationError {
    pub fn with_issue(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

/// Fully populated payload shared by unit and integration tests.
#[cfg(test)]
pub(crate) fn sample_extraction() -> ClauseExtraction {
    ClauseExtraction {
        parties: Parties {
            party_one: Some("Acme Corporation".to_string()),
            party_two: Some("Widget Industries Ltd".to_string()),
            additional_parties: vec!["Escrow Partners LLC".to_string()],
        },
        dates: ContractDates {
            effective_date: Some("2024-03-01".to_string()),
            termination_date: Some("2027-02-28".to_string()),
            term_length: Some("3 years".to_string()),
        },
        clauses: Clauses {
            governing_law: Some("State of Delaware".to_string()),
            termination: Some("Either party may terminate with 90 days notice.".to_string()),
            confidentiality: Some("Mutual NDA for 5 years post termination.".to_string()),
            payment_terms: Some("Net 30 from invoice date.".to_string()),
            ..Clauses::default()
        },
        confidence: 0.87,
        summary: Some("Supply agreement between Acme and Widget.".to_string()),
    }
}
