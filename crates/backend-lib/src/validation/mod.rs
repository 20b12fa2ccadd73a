// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Request validation module.

use neurodyx_common::MAX_SCREENING_ANSWERS;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Common validation constants
const MAX_CREDENTIAL_LENGTH: usize = 4096;
const MAX_AGE_GROUP_LENGTH: usize = 32;
const MAX_QUESTION_LENGTH: usize = 500;

// Regex patterns for validation
static AGE_GROUP_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid credential format: {0}")]
    InvalidCredential(String),

    #[error("Invalid auth type: {0}")]
    InvalidAuthType(String),

    #[error("Invalid age group: {0}")]
    InvalidAgeGroup(String),

    #[error("Invalid question: {0}")]
    InvalidQuestion(String),

    #[error("Invalid answers: {0}")]
    InvalidAnswers(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate the shape of a bearer, refresh or external credential.
///
/// Says nothing about whether the credential is genuine.
pub fn validate_credential(token: &str) -> ValidationResult<&str> {
    if token.is_empty() {
        return Err(ValidationError::InvalidCredential("must not be empty".to_string()));
    }

    if token.len() > MAX_CREDENTIAL_LENGTH {
        return Err(ValidationError::InvalidCredential(format!(
            "must be at most {MAX_CREDENTIAL_LENGTH} bytes"
        )));
    }

    if token.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidCredential(
            "must not contain whitespace".to_string(),
        ));
    }

    Ok(token)
}

/// Validate an age group used as a collection id and cache key
pub fn validate_age_group(age_group: &str) -> ValidationResult<&str> {
    if age_group.is_empty() {
        return Err(ValidationError::InvalidAgeGroup("must not be empty".to_string()));
    }

    if age_group.len() > MAX_AGE_GROUP_LENGTH {
        return Err(ValidationError::InvalidAgeGroup(format!(
            "must be at most {MAX_AGE_GROUP_LENGTH} characters"
        )));
    }

    // Only characters that are safe inside a document path
    if !AGE_GROUP_REGEX.is_match(age_group) {
        return Err(ValidationError::InvalidAgeGroup(
            "must contain only letters, digits, '-' and '_'".to_string(),
        ));
    }

    Ok(age_group)
}

/// Validate the text of a screening question
pub fn validate_question_text(question: &str) -> ValidationResult<&str> {
    let length = question.trim().chars().count();
    if length == 0 {
        return Err(ValidationError::InvalidQuestion("must not be empty".to_string()));
    }

    if length > MAX_QUESTION_LENGTH {
        return Err(ValidationError::InvalidQuestion(format!(
            "must be at most {MAX_QUESTION_LENGTH} characters"
        )));
    }

    Ok(question)
}

/// Validate a screening submission against the number of questions asked
pub fn validate_answers(answers: &[bool], question_count: usize) -> ValidationResult<&[bool]> {
    if answers.is_empty() || answers.len() > MAX_SCREENING_ANSWERS {
        return Err(ValidationError::InvalidAnswers(format!(
            "expected between 1 and {MAX_SCREENING_ANSWERS} answers"
        )));
    }

    if answers.len() != question_count {
        return Err(ValidationError::InvalidAnswers(format!(
            "expected {question_count} answers, got {}",
            answers.len()
        )));
    }

    Ok(answers)
}
