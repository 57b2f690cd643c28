//! Prompt construction utilities for the structured extraction pipeline.
//!
//! These helpers stay pure and generate the textual instructions and schema
//! payloads needed by the structured-output endpoint.

use serde_json::Value as JsonValue;

use super::result::ClauseExtraction;

/// Complete prompt package for a single document.
#[derive(Debug, Clone)]
pub struct ExtractionPrompt {
    pub system_message: String,
    pub user_message: String,
    pub schema: JsonValue,
}

/// Build the prompt skeleton for the provided document text.
pub fn build_prompt(document_text: &str) -> ExtractionPrompt {
    let schema = ClauseExtraction::schema();

    let system_message = format!(
        "You are a legal document analyzer specializing in contract clause extraction.\n\
        Analyze the provided contract text and extract the following information:\n\n\
        {}\n\n\
        If a field cannot be determined from the text, leave it as null.\n\
        Be precise and extract actual text snippets or paraphrased content, not placeholders.",
        build_guidelines()
    );

    let user_message = format!("Analyze this contract:\n\n{document_text}");

    ExtractionPrompt {
        system_message,
        user_message,
        schema,
    }
}

fn build_guidelines() -> String {
    let items = [
        "`parties`: identify the contracting parties (party_one, party_two, and any additional parties).",
        "`dates`: extract effective date, termination date, and term length; use ISO format YYYY-MM-DD for dates.",
        "`clauses.governing_law`: the governing jurisdiction.",
        "`clauses.termination`: termination provisions.",
        "`clauses.confidentiality`: confidentiality terms.",
        "`clauses.indemnification`: indemnification clauses.",
        "`clauses.limitation_of_liability`: liability caps and exclusions.",
        "`clauses.dispute_resolution`: dispute resolution mechanism.",
        "`clauses.payment_terms`: payment terms.",
        "`clauses.intellectual_property`: intellectual property provisions.",
        "`confidence`: rate your confidence in the extraction from 0.0 to 1.0.",
        "`summary`: a brief summary of the contract's purpose.",
    ];

    items
        .iter()
        .map(|line| format!("  * {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
