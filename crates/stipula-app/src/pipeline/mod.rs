//! Pure pipeline data types and prompt builders.
//!
//! Everything here is side-effect free; IO-bound stage execution lives in
//! `crate::services`.

pub mod prompt;
pub mod result;

pub use prompt::{ExtractionPrompt, build_prompt};
pub use result::{
    ClauseExtraction, Clauses, ContractDates, ExtractionValidationError, Parties,
};
