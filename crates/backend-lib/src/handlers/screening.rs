// ============================
// crates/backend-lib/src/handlers/screening.rs
// ============================
//! Screening question bank and submission endpoints.
use axum::{extract::State, http::StatusCode};
use neurodyx_common::{QuestionCreated, ScreeningOutcome, ScreeningQuestion, ScreeningSubmission};
use serde::Deserialize;

use crate::error::AppError;
use crate::extract::{Json, Path, Query};
use crate::middleware::AuthenticatedSubject;
use crate::AppState;

/// `?ageGroup=` query parameter
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeGroupQuery {
    #[serde(default)]
    pub age_group: Option<String>,
}

/// `GET /api/screening/questions[?ageGroup=..]`; without an age group every
/// group is listed
pub async fn list_questions(
    State(state): State<AppState>,
    Query(query): Query<AgeGroupQuery>,
) -> Result<Json<Vec<ScreeningQuestion>>, AppError> {
    let questions = match query.age_group.as_deref() {
        None | Some("") => state.screening.all_questions().await?,
        Some(age_group) => state.screening.questions(age_group).await?,
    };
    Ok(Json(questions))
}

/// `POST /api/screening/submit`
pub async fn submit_screening(
    State(state): State<AppState>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    Json(submission): Json<ScreeningSubmission>,
) -> Result<Json<ScreeningOutcome>, AppError> {
    let outcome = state.screening.submit(&subject, &submission).await?;
    Ok(Json(outcome))
}

/// `POST /api/screening/questions` (admin)
pub async fn add_question(
    State(state): State<AppState>,
    Json(question): Json<ScreeningQuestion>,
) -> Result<(StatusCode, Json<QuestionCreated>), AppError> {
    let question_id = state.screening.create(&question).await?;
    Ok((StatusCode::CREATED, Json(QuestionCreated { question_id })))
}

/// `PUT /api/screening/questions/{id}` (admin)
pub async fn update_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(question): Json<ScreeningQuestion>,
) -> Result<StatusCode, AppError> {
    state.screening.update(&id, &question).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/screening/questions/{id}?ageGroup=..` (admin)
pub async fn delete_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AgeGroupQuery>,
) -> Result<StatusCode, AppError> {
    let age_group = query.age_group.unwrap_or_default();
    state.screening.delete(&age_group, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
