// ============================
// crates/backend-lib/src/screening.rs
// ============================
//! Screening question bank and submissions.
//!
//! Question lists are read cache-aside, keyed by age group, plus one entry
//! for the listing of every group. Every write to a group evicts its key and
//! the all-groups entry before the write is reported as done.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use neurodyx_common::{RiskLevel, ScreeningOutcome, ScreeningQuestion, ScreeningSubmission};
use serde_json::{json, Value};

use crate::auth::user_path;
use crate::cache::{Lookup, TtlCache};
use crate::error::AppError;
use crate::metrics::{CACHE_INVALIDATED, UPSTREAM_TIMEOUT};
use crate::storage::{Document, DocumentStore, SetMode, StoreError};
use crate::validation::{validate_age_group, validate_answers, validate_question_text, ValidationError};

/// Root collection of the question bank
pub const QUESTIONS_ROOT: &str = "screeningQuestions";

/// Cache key of the all-groups listing; never a valid age group
const ALL_GROUPS_KEY: &str = "*";

fn group_path(age_group: &str) -> String {
    format!("{QUESTIONS_ROOT}/{age_group}")
}

fn questions_collection(age_group: &str) -> String {
    format!("{QUESTIONS_ROOT}/{age_group}/questions")
}

fn question_path(age_group: &str, id: &str) -> String {
    format!("{}/{id}", questions_collection(age_group))
}

fn document_id(id: &str) -> Result<&str, AppError> {
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(AppError::InvalidInput("invalid question id".into()));
    }
    Ok(id)
}

/// Question bank service
pub struct ScreeningService {
    store: Arc<dyn DocumentStore>,
    cache: TtlCache<String, Vec<ScreeningQuestion>>,
    upstream_timeout: Duration,
}

impl ScreeningService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: TtlCache<String, Vec<ScreeningQuestion>>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            upstream_timeout,
        }
    }

    pub fn cache(&self) -> &TtlCache<String, Vec<ScreeningQuestion>> {
        &self.cache
    }

    /// Every question of `age_group`, served from the cache when fresh
    pub async fn questions(&self, age_group: &str) -> Result<Vec<ScreeningQuestion>, AppError> {
        validate_age_group(age_group)?;

        let ticket = match self.cache.lookup(&age_group.to_string()) {
            Lookup::Hit(cached) => return Ok(cached),
            Lookup::Miss(ticket) => ticket,
        };

        let questions = self.load_group(age_group).await?;
        tracing::debug!(age_group, count = questions.len(), "loaded screening questions");

        self.cache.put_if_current(age_group.to_string(), ticket, questions.clone());
        Ok(questions)
    }

    /// Every question of every age group, grouped in age-group order
    pub async fn all_questions(&self) -> Result<Vec<ScreeningQuestion>, AppError> {
        let ticket = match self.cache.lookup(&ALL_GROUPS_KEY.to_string()) {
            Lookup::Hit(cached) => return Ok(cached),
            Lookup::Miss(ticket) => ticket,
        };

        let groups = self.with_deadline(self.store.list(QUESTIONS_ROOT)).await??;
        let mut questions = Vec::new();
        for (age_group, _) in groups {
            questions.extend(self.load_group(&age_group).await?);
        }
        tracing::debug!(count = questions.len(), "loaded screening questions of every group");

        self.cache.put_if_current(ALL_GROUPS_KEY.to_string(), ticket, questions.clone());
        Ok(questions)
    }

    async fn load_group(&self, age_group: &str) -> Result<Vec<ScreeningQuestion>, AppError> {
        let docs = self
            .with_deadline(self.store.list(&questions_collection(age_group)))
            .await??;

        Ok(docs
            .into_iter()
            .filter_map(|(id, doc)| {
                let question = doc.get("question")?.as_str()?.to_string();
                Some(ScreeningQuestion {
                    id: Some(id),
                    age_group: age_group.to_string(),
                    question,
                })
            })
            .collect())
    }

    /// Add a question; returns its id
    pub async fn create(&self, question: &ScreeningQuestion) -> Result<String, AppError> {
        let (age_group, text) = Self::validated(question)?;
        self.register_group(age_group).await?;

        let id = self
            .with_deadline(
                self.store
                    .add(&questions_collection(age_group), self.question_fields(age_group, text)),
            )
            .await??;

        self.invalidate(age_group);
        tracing::info!(age_group, question_id = %id, "screening question created");
        Ok(id)
    }

    /// Replace the text of an existing question
    pub async fn update(&self, id: &str, question: &ScreeningQuestion) -> Result<(), AppError> {
        let id = document_id(id)?;
        let (age_group, text) = Self::validated(question)?;
        let path = question_path(age_group, id);

        if self.with_deadline(self.store.get(&path)).await??.is_none() {
            return Err(StoreError::NotFound(path).into());
        }
        self.register_group(age_group).await?;

        self.with_deadline(
            self.store
                .set(&path, self.question_fields(age_group, text), SetMode::MergeAll),
        )
        .await??;

        self.invalidate(age_group);
        tracing::info!(age_group, question_id = id, "screening question updated");
        Ok(())
    }

    /// Delete a question; deleting a missing question succeeds
    pub async fn delete(&self, age_group: &str, id: &str) -> Result<(), AppError> {
        let id = document_id(id)?;
        validate_age_group(age_group)?;

        self.with_deadline(self.store.delete(&question_path(age_group, id)))
            .await??;

        self.invalidate(age_group);
        tracing::info!(age_group, question_id = id, "screening question deleted");
        Ok(())
    }

    /// Score a submission and store it as the subject's current screening
    pub async fn submit(
        &self,
        subject: &str,
        submission: &ScreeningSubmission,
    ) -> Result<ScreeningOutcome, AppError> {
        let questions = self.questions(&submission.age_group).await?;
        if questions.is_empty() {
            return Err(ValidationError::InvalidAgeGroup(format!(
                "no screening questions for '{}'",
                submission.age_group
            ))
            .into());
        }
        validate_answers(&submission.answers, questions.len())?;

        let risk_level = RiskLevel::from_answers(&submission.answers);
        let mut fields = Document::new();
        fields.insert("ageGroup".into(), Value::String(submission.age_group.clone()));
        fields.insert("answers".into(), json!(submission.answers));
        fields.insert("riskLevel".into(), json!(risk_level));
        fields.insert("timestamp".into(), Value::String(self.store.server_time().to_rfc3339()));

        let path = format!("{}/screenings/current", user_path(subject));
        self.with_deadline(self.store.set(&path, fields, SetMode::MergeAll))
            .await?
            .map_err(|e| AppError::PersistenceFailure(e.to_string()))?;

        tracing::info!(subject, age_group = %submission.age_group, ?risk_level, "screening submitted");
        Ok(ScreeningOutcome { risk_level })
    }

    fn validated(question: &ScreeningQuestion) -> Result<(&str, &str), AppError> {
        let age_group = validate_age_group(&question.age_group)?;
        let text = validate_question_text(&question.question)?;
        Ok((age_group, text))
    }

    fn question_fields(&self, age_group: &str, text: &str) -> Document {
        let mut fields = Document::new();
        fields.insert("ageGroup".into(), Value::String(age_group.to_string()));
        fields.insert("question".into(), Value::String(text.to_string()));
        fields.insert("timestamp".into(), Value::String(self.store.server_time().to_rfc3339()));
        fields
    }

    /// Record `age_group` in the group index read by [`Self::all_questions`]
    async fn register_group(&self, age_group: &str) -> Result<(), AppError> {
        let mut fields = Document::new();
        fields.insert("ageGroup".into(), Value::String(age_group.to_string()));
        self.with_deadline(self.store.set(&group_path(age_group), fields, SetMode::MergeAll))
            .await??;
        Ok(())
    }

    fn invalidate(&self, age_group: &str) {
        for key in [age_group, ALL_GROUPS_KEY] {
            if self.cache.invalidate(&key.to_string()) {
                counter!(CACHE_INVALIDATED, "cache" => "questions").increment(1);
            }
        }
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = T>) -> Result<T, AppError> {
        tokio::time::timeout(self.upstream_timeout, fut).await.map_err(|_| {
            counter!(UPSTREAM_TIMEOUT, "upstream" => "document store").increment(1);
            tracing::warn!("document store call timed out");
            AppError::UpstreamTimeout("document store")
        })
    }
}
