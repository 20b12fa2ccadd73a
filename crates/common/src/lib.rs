// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between the Neurodyx clients and the backend.
//! This module defines the JSON request and response bodies of the REST API.

use serde::{Deserialize, Serialize};

/// Maximum number of answers accepted in a single screening submission
pub const MAX_SCREENING_ANSWERS: usize = 50;

/// Body of `POST /api/auth`
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Raw credential issued by the external identity provider
    pub token: String,
    /// Which provider issued `token`: `"firebase"` or `"google"`
    pub auth_type: String,
}

/// Body of `POST /api/refresh`
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Refresh credential returned by a previous `/auth` or `/refresh` call
    pub refresh_token: String,
}

/// Successful response of `/auth` and `/refresh`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Short-lived access credential
    pub token: String,
    /// Long-lived refresh credential
    pub refresh_token: String,
}

/// Error body returned by every endpoint
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    /// Stable, user-presentable message
    pub error: String,
    /// Machine-readable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A screening question, grouped by age group
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningQuestion {
    /// Document id, assigned by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Age group the question belongs to
    pub age_group: String,
    /// Question text
    pub question: String,
}

/// A user's answers to every question of one age group
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningSubmission {
    pub age_group: String,
    #[serde(default)]
    pub answers: Vec<bool>,
}

/// Risk classification derived from a screening submission
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    /// Classify by the share of `true` answers: up to 40% is low,
    /// up to 70% is moderate, anything above is high.
    pub fn from_answers(answers: &[bool]) -> Self {
        if answers.is_empty() {
            return RiskLevel::Low;
        }
        let positives = answers.iter().filter(|a| **a).count();
        let percentage = positives as f64 / answers.len() as f64 * 100.0;
        if percentage <= 40.0 {
            RiskLevel::Low
        } else if percentage <= 70.0 {
            RiskLevel::Moderate
        } else {
            RiskLevel::High
        }
    }
}

/// Response of `POST /api/screening/submit`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningOutcome {
    pub risk_level: RiskLevel,
}

/// Response of `POST /api/screening/questions`
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QuestionCreated {
    #[serde(rename = "questionID")]
    pub question_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_request_uses_camel_case() {
        let req: AuthRequest =
            serde_json::from_str(r#"{"token":"abc","authType":"google"}"#).unwrap();
        assert_eq!(req.token, "abc");
        assert_eq!(req.auth_type, "google");

        let body = serde_json::to_value(AuthResponse {
            token: "a".into(),
            refresh_token: "r".into(),
        })
        .unwrap();
        assert_eq!(body["refreshToken"], "r");
    }

    #[test]
    fn risk_level_thresholds() {
        assert_eq!(RiskLevel::from_answers(&[true, false, false, false, false]), RiskLevel::Low);
        assert_eq!(RiskLevel::from_answers(&[true, true, false, false, false]), RiskLevel::Low);
        assert_eq!(RiskLevel::from_answers(&[true, true, true, false, false]), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_answers(&[true, true, true, true, false]), RiskLevel::High);
        assert_eq!(RiskLevel::from_answers(&[]), RiskLevel::Low);
    }

    #[test]
    fn risk_level_serializes_lowercase() {
        let json = serde_json::to_string(&ScreeningOutcome { risk_level: RiskLevel::Moderate }).unwrap();
        assert_eq!(json, r#"{"riskLevel":"moderate"}"#);
    }
}
