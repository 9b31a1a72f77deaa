//! Server submissions: the public form, the ranked list and the admin
//! review queue.
//!
//! [`SubmissionStore`] keeps the last fetched list of the
//! `server_submissions` table together with the last error, the way the
//! views render them. Every failure is recorded as
//! `"Failed to <action> submission(s): <message>"` and also returned.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::error::Result;
use crate::rest::{Order, Query, RestClient};
use crate::validation::{require, sanitize_input};

/// Table holding submissions.
pub const SUBMISSIONS_TABLE: &str = "server_submissions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerType {
    Vanilla,
    Modded,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vanilla => "Vanilla",
            Self::Modded => "Modded",
        })
    }
}

/// Whether a server's content needs a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentWarning {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rank {
    Unranked,
    Ranked,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unranked => "Unranked",
            Self::Ranked => "Ranked",
        })
    }
}

/// A row of the submissions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSubmission {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub server_type: ServerType,
    pub description: String,
    pub name: String,
    pub server_ip: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub discord: Option<String>,
    pub content_warning: ContentWarning,
    /// Admin rating; empty until reviewed.
    #[serde(default)]
    pub rating: String,
    #[serde(default)]
    pub notes: String,
    pub rank: Rank,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Submitting user, if they were signed in.
    #[serde(default)]
    pub uid: Option<String>,
}

impl ServerSubmission {
    /// Returns true until an admin has given a rating.
    pub fn is_unrated(&self) -> bool {
        self.rating.is_empty()
    }

    fn apply_review(&mut self, review: &SubmissionReview) {
        self.rating.clone_from(&review.rating);
        self.notes.clone_from(&review.notes);
        self.rank = review.rank;
        self.reviewed_at = Some(review.reviewed_at);
    }
}

/// Values entered in the public submission form.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub server_type: ServerType,
    pub description: String,
    pub name: String,
    pub server_ip: String,
    pub website: String,
    pub discord: String,
    pub content_warning: ContentWarning,
}

/// The user-editable columns, sanitized.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct SubmissionFields {
    server_type: ServerType,
    description: String,
    name: String,
    server_ip: String,
    website: Option<String>,
    discord: Option<String>,
    content_warning: ContentWarning,
}

/// Insert payload built from a [`NewSubmission`].
#[derive(Debug, Clone, PartialEq, Serialize)]
struct SubmissionRow {
    #[serde(flatten)]
    fields: SubmissionFields,
    uid: Option<String>,
    created_at: DateTime<Utc>,
    rating: String,
    notes: String,
    rank: Rank,
}

impl NewSubmission {
    /// Sanitizes every field. Blank optional links become null.
    fn sanitized(self) -> Result<SubmissionFields> {
        let name = sanitize_input(self.name.trim());
        let server_ip = sanitize_input(self.server_ip.trim());
        require("Server name", &name)?;
        require("Server IP", &server_ip)?;

        let optional = |value: String| {
            let value = sanitize_input(value.trim());
            (!value.is_empty()).then_some(value)
        };

        Ok(SubmissionFields {
            server_type: self.server_type,
            description: sanitize_input(self.description.trim()),
            name,
            server_ip,
            website: optional(self.website),
            discord: optional(self.discord),
            content_warning: self.content_warning,
        })
    }

    /// Builds the row to insert: unrated and unranked.
    fn into_row(self, uid: Option<String>, now: DateTime<Utc>) -> Result<SubmissionRow> {
        Ok(SubmissionRow {
            fields: self.sanitized()?,
            uid,
            created_at: now,
            rating: String::new(),
            notes: String::new(),
            rank: Rank::Unranked,
        })
    }
}

impl From<&ServerSubmission> for NewSubmission {
    /// Prefills the edit form from an existing submission.
    fn from(submission: &ServerSubmission) -> Self {
        Self {
            server_type: submission.server_type,
            description: submission.description.clone(),
            name: submission.name.clone(),
            server_ip: submission.server_ip.clone(),
            website: submission.website.clone().unwrap_or_default(),
            discord: submission.discord.clone().unwrap_or_default(),
            content_warning: submission.content_warning,
        }
    }
}

/// Patch written when an admin reviews a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReview {
    pub rating: String,
    pub notes: String,
    pub rank: Rank,
    pub reviewed_at: DateTime<Utc>,
}

impl SubmissionReview {
    /// A review is ranked iff it carries a rating.
    pub fn new(rating: &str, notes: &str, reviewed_at: DateTime<Utc>) -> Self {
        let rating = rating.trim().to_string();
        let rank = if rating.is_empty() { Rank::Unranked } else { Rank::Ranked };
        Self {
            rating,
            notes: notes.trim().to_string(),
            rank,
            reviewed_at,
        }
    }
}

/// Submission list state backed by the submissions table.
#[derive(Debug)]
pub struct SubmissionStore {
    client: RestClient,
    submissions: RwLock<Vec<ServerSubmission>>,
    error: RwLock<Option<String>>,
}

impl SubmissionStore {
    pub fn new(client: RestClient) -> Self {
        Self {
            client,
            submissions: RwLock::new(Vec::new()),
            error: RwLock::new(None),
        }
    }

    /// Returns the last fetched submissions, newest first.
    pub fn submissions(&self) -> Vec<ServerSubmission> {
        self.submissions.read().clone()
    }

    /// Returns the last recorded error.
    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn clear_error(&self) {
        *self.error.write() = None;
    }

    /// Submissions an admin has ranked, for the public list.
    pub fn ranked(&self) -> Vec<ServerSubmission> {
        self.submissions
            .read()
            .iter()
            .filter(|s| s.rank == Rank::Ranked)
            .cloned()
            .collect()
    }

    /// Submissions still waiting for a rating.
    pub fn unranked(&self) -> Vec<ServerSubmission> {
        self.submissions
            .read()
            .iter()
            .filter(|s| s.is_unrated())
            .cloned()
            .collect()
    }

    /// Picks a random submission without a rating.
    pub fn pick_unranked(&self) -> Option<ServerSubmission> {
        self.unranked().choose(&mut rand::rng()).cloned()
    }

    /// Reloads every submission, newest first.
    pub async fn fetch_submissions(&self) -> Result<Vec<ServerSubmission>> {
        *self.error.write() = None;
        let query = Query::new().order("created_at", Order::Descending);

        match self.client.select::<ServerSubmission>(SUBMISSIONS_TABLE, &query).await {
            Ok(rows) => {
                debug!(count = rows.len(), "Submissions fetched");
                *self.submissions.write() = rows.clone();
                Ok(rows)
            }
            Err(e) => Err(self.failed("fetch submissions", e)),
        }
    }

    /// Fetches the submissions made by one user. The shared list is left as is.
    pub async fn fetch_for_user(&self, uid: &str) -> Result<Vec<ServerSubmission>> {
        *self.error.write() = None;
        let query = Query::new()
            .eq("uid", uid)
            .order("created_at", Order::Descending);

        self.client
            .select(SUBMISSIONS_TABLE, &query)
            .await
            .map_err(|e| self.failed("fetch submissions", e))
    }

    /// Inserts a submission from the public form.
    pub async fn create_submission(&self, submission: NewSubmission, uid: Option<String>) -> Result<()> {
        *self.error.write() = None;
        let signed_in = uid.is_some();
        let row = submission.into_row(uid, Utc::now())?;

        self.client
            .insert(SUBMISSIONS_TABLE, &[row])
            .await
            .map_err(|e| self.failed("create submission", e))?;

        info!(signed_in, "Submission created");
        Ok(())
    }

    /// Stores an admin review and merges it into the local list.
    pub async fn review_submission(&self, id: &str, rating: &str, notes: &str) -> Result<SubmissionReview> {
        *self.error.write() = None;
        let review = SubmissionReview::new(rating, notes, Utc::now());

        self.client
            .update(SUBMISSIONS_TABLE, &review, &Query::new().eq("id", id))
            .await
            .map_err(|e| self.failed("update submission", e))?;

        if let Some(submission) = self.submissions.write().iter_mut().find(|s| s.id == id) {
            submission.apply_review(&review);
        }
        info!(submission_id = %id, rank = %review.rank, "Submission reviewed");
        Ok(review)
    }

    /// Edits one of the user's own submissions and returns their refetched
    /// list.
    ///
    /// The patch only touches form columns and is filtered by both `id` and
    /// `uid`, so another user's row is never matched.
    pub async fn update_own_submission(
        &self,
        id: &str,
        uid: &str,
        submission: NewSubmission,
    ) -> Result<Vec<ServerSubmission>> {
        *self.error.write() = None;
        let fields = submission.sanitized()?;

        self.client
            .update(SUBMISSIONS_TABLE, &fields, &Query::new().eq("id", id).eq("uid", uid))
            .await
            .map_err(|e| self.failed("update submission", e))?;

        info!(submission_id = %id, "Own submission updated");
        self.fetch_for_user(uid).await
    }

    /// Deletes a submission and drops it from the local list.
    pub async fn delete_submission(&self, id: &str) -> Result<()> {
        *self.error.write() = None;

        self.client
            .delete(SUBMISSIONS_TABLE, &Query::new().eq("id", id))
            .await
            .map_err(|e| self.failed("delete submission", e))?;

        self.submissions.write().retain(|s| s.id != id);
        info!(submission_id = %id, "Submission deleted");
        Ok(())
    }

    fn failed(&self, action: &str, err: BackendError) -> crate::error::ClientError {
        let message = format!("Failed to {action}: {err}");
        warn!(error = %err, "Failed to {action}");
        *self.error.write() = Some(message);
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn form() -> NewSubmission {
        NewSubmission {
            server_type: ServerType::Modded,
            description: "Weekly wipe <b>PvE</b>".to_string(),
            name: " Rusty Moose ".to_string(),
            server_ip: "play.example.com:28015".to_string(),
            website: "   ".to_string(),
            discord: "discord.gg/moose".to_string(),
            content_warning: ContentWarning::No,
        }
    }

    fn row(id: &str, rating: &str, rank: &str) -> serde_json::Value {
        json!({
            "id": id,
            "created_at": "2026-10-01T12:00:00+00:00",
            "server_type": "Vanilla",
            "description": "Solo/duo",
            "name": format!("Server {id}"),
            "server_ip": "10.0.0.1:28015",
            "website": null,
            "discord": null,
            "content_warning": "No",
            "rating": rating,
            "notes": "",
            "rank": rank,
            "reviewed_at": null,
            "uid": null
        })
    }

    async fn store_with_rows(mock_server: &MockServer, rows: serde_json::Value) -> SubmissionStore {
        Mock::given(method("GET"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("order", "created_at.desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(mock_server)
            .await;

        let client = RestClient::new(mock_server.uri(), "anon").unwrap();
        let store = SubmissionStore::new(client);
        store.fetch_submissions().await.expect("fetch should succeed");
        store
    }

    // ==================== Form tests ====================

    #[test]
    fn new_submission_row_is_sanitized_and_unranked() {
        let now = Utc::now();
        let row = form().into_row(Some("user-1".to_string()), now).unwrap();

        assert_eq!(row.fields.name, "Rusty Moose");
        assert_eq!(row.fields.description, "Weekly wipe bPvE/b");
        assert_eq!(row.fields.website, None);
        assert_eq!(row.fields.discord.as_deref(), Some("discord.gg/moose"));
        assert_eq!(row.rank, Rank::Unranked);
        assert!(row.rating.is_empty() && row.notes.is_empty());
        assert_eq!(row.created_at, now);
    }

    #[test]
    fn new_submission_requires_name_and_ip() {
        let mut submission = form();
        submission.server_ip = "<>".to_string();

        let err = submission.into_row(None, Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "validation error: Server IP is required.");
    }

    #[test]
    fn review_is_ranked_only_with_rating() {
        let now = Utc::now();
        assert_eq!(SubmissionReview::new("8.5", "solid", now).rank, Rank::Ranked);
        assert_eq!(SubmissionReview::new("  ", "meh", now).rank, Rank::Unranked);
    }

    // ==================== Store tests ====================

    #[tokio::test]
    async fn ranked_and_unranked_views() {
        let mock_server = MockServer::start().await;
        let store = store_with_rows(
            &mock_server,
            json!([row("a", "9", "Ranked"), row("b", "", "Unranked"), row("c", "", "Unranked")]),
        )
        .await;

        let ranked: Vec<String> = store.ranked().into_iter().map(|s| s.id).collect();
        assert_eq!(ranked, vec!["a"]);
        assert_eq!(store.unranked().len(), 2);

        let picked = store.pick_unranked().expect("an unranked submission");
        assert!(picked.id == "b" || picked.id == "c");
    }

    #[tokio::test]
    async fn pick_unranked_on_empty_queue() {
        let mock_server = MockServer::start().await;
        let store = store_with_rows(&mock_server, json!([row("a", "9", "Ranked")])).await;

        assert!(store.pick_unranked().is_none());
    }

    #[tokio::test]
    async fn fetch_failure_records_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/server_submissions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "database offline"})))
            .mount(&mock_server)
            .await;

        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        assert!(store.fetch_submissions().await.is_err());
        assert_eq!(
            store.error().as_deref(),
            Some("Failed to fetch submissions: database offline")
        );

        store.clear_error();
        assert!(store.error().is_none());
    }

    #[tokio::test]
    async fn review_merges_into_local_list() {
        let mock_server = MockServer::start().await;
        let store = store_with_rows(&mock_server, json!([row("b", "", "Unranked")])).await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("id", "eq.b"))
            .and(body_partial_json(json!({"rating": "7", "notes": "good admins", "rank": "Ranked"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let review = store.review_submission("b", "7", "good admins").await.unwrap();

        let updated = &store.submissions()[0];
        assert_eq!(updated.rank, Rank::Ranked);
        assert_eq!(updated.rating, "7");
        assert_eq!(updated.reviewed_at, Some(review.reviewed_at));
        assert!(store.unranked().is_empty());
    }

    #[tokio::test]
    async fn review_failure_leaves_list_untouched() {
        let mock_server = MockServer::start().await;
        let store = store_with_rows(&mock_server, json!([row("b", "", "Unranked")])).await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/server_submissions"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "permission denied"
            })))
            .mount(&mock_server)
            .await;

        assert!(store.review_submission("b", "7", "").await.is_err());
        assert_eq!(store.submissions()[0].rank, Rank::Unranked);
        assert_eq!(
            store.error().as_deref(),
            Some("Failed to update submission: permission denied")
        );
    }

    #[tokio::test]
    async fn delete_removes_from_local_list() {
        let mock_server = MockServer::start().await;
        let store = store_with_rows(&mock_server, json!([row("a", "9", "Ranked"), row("b", "", "Unranked")])).await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("id", "eq.a"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        store.delete_submission("a").await.unwrap();
        let ids: Vec<String> = store.submissions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn create_inserts_unranked_row() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/server_submissions"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        store
            .create_submission(form(), Some("user-1".to_string()))
            .await
            .expect("create should succeed");

        let requests = mock_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let inserted = &body[0];
        assert_eq!(inserted["name"], "Rusty Moose");
        assert_eq!(inserted["server_type"], "Modded");
        assert_eq!(inserted["rank"], "Unranked");
        assert_eq!(inserted["rating"], "");
        assert_eq!(inserted["website"], serde_json::Value::Null);
        assert_eq!(inserted["uid"], "user-1");
    }

    #[tokio::test]
    async fn fetch_for_user_filters_by_uid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("uid", "eq.user-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("mine", "", "Unranked")])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        let mine = store.fetch_for_user("user-1").await.unwrap();

        assert_eq!(mine.len(), 1);
        assert!(store.submissions().is_empty());
    }

    #[tokio::test]
    async fn update_own_submission_patches_form_fields_and_refetches() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("id", "eq.mine"))
            .and(query_param("uid", "eq.user-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut edited = row("mine", "", "Unranked");
        edited["name"] = json!("Rusty Moose");
        Mock::given(method("GET"))
            .and(path("/rest/v1/server_submissions"))
            .and(query_param("uid", "eq.user-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([edited])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        let mine = store
            .update_own_submission("mine", "user-1", form())
            .await
            .expect("update should succeed");

        assert_eq!(mine[0].name, "Rusty Moose");

        let requests = mock_server.received_requests().await.unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(patch["name"], "Rusty Moose");
        assert_eq!(patch["description"], "Weekly wipe bPvE/b");
        assert_eq!(patch["website"], serde_json::Value::Null);
        for column in ["rating", "notes", "rank", "uid", "created_at", "reviewed_at"] {
            assert!(patch.get(column).is_none(), "patch must not touch {column}");
        }
    }

    #[tokio::test]
    async fn update_own_submission_validates_before_request() {
        let mock_server = MockServer::start().await;
        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());

        let mut submission = form();
        submission.name = "   ".to_string();

        let err = store.update_own_submission("mine", "user-1", submission).await.unwrap_err();
        assert_eq!(err.to_string(), "validation error: Server name is required.");
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_own_submission_failure_records_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/server_submissions"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"message": "permission denied"})))
            .mount(&mock_server)
            .await;

        let store = SubmissionStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        assert!(store.update_own_submission("theirs", "user-1", form()).await.is_err());
        assert_eq!(
            store.error().as_deref(),
            Some("Failed to update submission: permission denied")
        );
    }

    #[test]
    fn edit_form_prefills_from_submission() {
        let submission: ServerSubmission = serde_json::from_value(row("a", "9", "Ranked")).unwrap();
        let form = NewSubmission::from(&submission);

        assert_eq!(form.name, "Server a");
        assert_eq!(form.website, "");
        assert_eq!(form.content_warning, ContentWarning::No);
    }
}
