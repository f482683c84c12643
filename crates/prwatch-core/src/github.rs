//! Read-only GitHub REST client for pull requests, comments and Actions runs.
//!
//! No retries happen here: a failed fetch propagates to the poller, which
//! logs it and tries again next cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::types::{
    ChangeRequest, ChangeRequestId, Comment, CommentKind, Conclusion, LifecycleState, Run,
    RunStatus, Step, SubJob,
};

const PER_PAGE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("transient fetch error: {0}")]
    Transient(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Everything the poller needs from the code-review platform.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_change_request(&self, id: &ChangeRequestId) -> Result<ChangeRequest, FetchError>;

    /// Review (inline) and general comments, in that order.
    async fn fetch_comments(&self, id: &ChangeRequestId) -> Result<Vec<Comment>, FetchError>;

    /// CI runs for one revision.
    async fn fetch_runs(&self, id: &ChangeRequestId, revision: &str) -> Result<Vec<Run>, FetchError>;

    async fn fetch_sub_jobs(&self, id: &ChangeRequestId, run_id: i64) -> Result<Vec<SubJob>, FetchError>;

    /// Unified diff of the whole change request.
    async fn fetch_diff(&self, id: &ChangeRequestId) -> Result<String, FetchError>;

    /// Open pull request whose head branch is `branch`, if any.
    async fn find_change_request(&self, repo: &str, branch: &str) -> Result<Option<u64>, FetchError>;
}

pub struct GitHubClient {
    api_url: String,
    token: String,
    client: Client,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: Client::builder()
                .user_agent(concat!("prwatch/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }

    fn repo_url(&self, id: &ChangeRequestId, path: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, id.repo, path)
    }

    async fn get_raw(&self, url: &str, accept: &str) -> Result<reqwest::Response, FetchError> {
        let mut req = self
            .client
            .get(url)
            .header(header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let rate_limited = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0");
        let message = resp.text().await.unwrap_or_default();
        Err(classify_status(status, rate_limited, url, message))
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        debug!(url, "github GET");
        let resp = self.get_raw(url, "application/vnd.github+json").await?;
        Ok(resp.json().await?)
    }

    /// Follow `page=` pagination, collecting either a top-level array or the
    /// array under `key`.
    async fn get_paged(&self, base: &str, key: Option<&str>) -> Result<Vec<Value>, FetchError> {
        let sep = if base.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!("{base}{sep}per_page={PER_PAGE}&page={page}");
            let body = self.get_json(&url).await?;
            let arr = match key {
                Some(k) => body[k].as_array().cloned(),
                None => body.as_array().cloned(),
            }
            .ok_or_else(|| FetchError::Decode(format!("expected array from {url}")))?;
            let n = arr.len();
            items.extend(arr);
            if n < PER_PAGE as usize {
                break;
            }
        }
        Ok(items)
    }
}

fn classify_status(status: StatusCode, rate_limited: bool, url: &str, message: String) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound(url.to_string()),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS if rate_limited => {
            FetchError::Transient(format!("rate limited: {url}"))
        }
        StatusCode::TOO_MANY_REQUESTS => FetchError::Transient(format!("rate limited: {url}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth {
            status: status.as_u16(),
            message,
        },
        s => FetchError::Transient(format!("{url} returned {s}")),
    }
}

#[async_trait]
impl DataSource for GitHubClient {
    async fn fetch_change_request(&self, id: &ChangeRequestId) -> Result<ChangeRequest, FetchError> {
        let v = self.get_json(&self.repo_url(id, &format!("/pulls/{}", id.number))).await?;
        parse_change_request(id, &v)
    }

    async fn fetch_comments(&self, id: &ChangeRequestId) -> Result<Vec<Comment>, FetchError> {
        let review = self
            .get_paged(&self.repo_url(id, &format!("/pulls/{}/comments", id.number)), None)
            .await?;
        let general = self
            .get_paged(&self.repo_url(id, &format!("/issues/{}/comments", id.number)), None)
            .await?;
        let mut comments: Vec<Comment> = review
            .iter()
            .filter_map(|v| parse_comment(v, CommentKind::Review))
            .collect();
        comments.extend(general.iter().filter_map(|v| parse_comment(v, CommentKind::General)));
        Ok(comments)
    }

    async fn fetch_runs(&self, id: &ChangeRequestId, revision: &str) -> Result<Vec<Run>, FetchError> {
        let url = self.repo_url(id, &format!("/actions/runs?head_sha={revision}"));
        let runs = self.get_paged(&url, Some("workflow_runs")).await?;
        Ok(runs.iter().filter_map(parse_run).collect())
    }

    async fn fetch_sub_jobs(&self, id: &ChangeRequestId, run_id: i64) -> Result<Vec<SubJob>, FetchError> {
        let url = self.repo_url(id, &format!("/actions/runs/{run_id}/jobs"));
        let jobs = self.get_paged(&url, Some("jobs")).await?;
        Ok(jobs.iter().filter_map(|v| parse_job(run_id, v)).collect())
    }

    async fn fetch_diff(&self, id: &ChangeRequestId) -> Result<String, FetchError> {
        let url = self.repo_url(id, &format!("/pulls/{}", id.number));
        let resp = self.get_raw(&url, "application/vnd.github.diff").await?;
        Ok(resp.text().await?)
    }

    async fn find_change_request(&self, repo: &str, branch: &str) -> Result<Option<u64>, FetchError> {
        let owner = repo.split_once('/').map(|(o, _)| o).unwrap_or(repo);
        let url = format!(
            "{}/repos/{repo}/pulls?state=open&head={owner}:{branch}",
            self.api_url
        );
        let body = self.get_json(&url).await?;
        Ok(body
            .as_array()
            .and_then(|a| a.first())
            .and_then(|pr| pr["number"].as_u64()))
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

fn parse_ts(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn str_field(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().to_string()
}

pub fn parse_change_request(id: &ChangeRequestId, v: &Value) -> Result<ChangeRequest, FetchError> {
    let head_sha = v["head"]["sha"]
        .as_str()
        .ok_or_else(|| FetchError::Decode(format!("{id}: missing head.sha")))?
        .to_string();
    Ok(ChangeRequest {
        id: id.clone(),
        title: str_field(v, "title"),
        state: LifecycleState::from_github(v["state"].as_str().unwrap_or("open")),
        merged: v["merged"].as_bool().unwrap_or(false) || !v["merged_at"].is_null(),
        head_sha,
        head_ref: v["head"]["ref"].as_str().unwrap_or_default().to_string(),
        url: str_field(v, "html_url"),
    })
}

pub fn parse_comment(v: &Value, kind: CommentKind) -> Option<Comment> {
    Some(Comment {
        provider_id: v["id"].as_i64()?,
        kind,
        author: v["user"]["login"].as_str().unwrap_or("unknown").to_string(),
        body: str_field(v, "body"),
        path: v["path"].as_str().map(str::to_string),
        created_at: parse_ts(&v["created_at"]),
    })
}

pub fn parse_run(v: &Value) -> Option<Run> {
    let status = RunStatus::from_github(v["status"].as_str().unwrap_or_default());
    Some(Run {
        provider_id: v["id"].as_i64()?,
        name: v["name"]
            .as_str()
            .or_else(|| v["display_title"].as_str())
            .unwrap_or("unnamed")
            .to_string(),
        status,
        conclusion: if status == RunStatus::Completed {
            v["conclusion"].as_str().and_then(Conclusion::from_github)
        } else {
            None
        },
        head_sha: str_field(v, "head_sha"),
        url: str_field(v, "html_url"),
        run_number: v["run_number"].as_i64().unwrap_or(0),
        run_attempt: v["run_attempt"].as_i64().unwrap_or(1),
    })
}

pub fn parse_job(run_id: i64, v: &Value) -> Option<SubJob> {
    let failed_steps: Vec<Step> = v["steps"]
        .as_array()
        .map(|steps| {
            steps
                .iter()
                .map(|s| Step {
                    name: str_field(s, "name"),
                    number: s["number"].as_i64().unwrap_or(0),
                    status: RunStatus::from_github(s["status"].as_str().unwrap_or_default()),
                    conclusion: s["conclusion"].as_str().and_then(Conclusion::from_github),
                    started_at: parse_ts(&s["started_at"]),
                    completed_at: parse_ts(&s["completed_at"]),
                })
                .filter(|s| s.conclusion.is_some_and(|c| c.is_failure()))
                .collect()
        })
        .unwrap_or_default();
    let status = RunStatus::from_github(v["status"].as_str().unwrap_or_default());
    Some(SubJob {
        provider_id: v["id"].as_i64()?,
        run_provider_id: run_id,
        name: str_field(v, "name"),
        status,
        conclusion: if status == RunStatus::Completed {
            v["conclusion"].as_str().and_then(Conclusion::from_github)
        } else {
            None
        },
        error_message: failed_steps.first().map(|s| s.name.clone()),
        failed_steps,
        url: str_field(v, "html_url"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pull_request() {
        let id = ChangeRequestId::new("acme/widgets", 5);
        let v = json!({
            "title": "Add widgets",
            "state": "closed",
            "merged": true,
            "html_url": "https://github.com/acme/widgets/pull/5",
            "head": {"sha": "deadbeef", "ref": "feature/widgets"}
        });
        let cr = parse_change_request(&id, &v).unwrap();
        assert!(cr.is_closed());
        assert!(cr.merged);
        assert_eq!(cr.head_sha, "deadbeef");
        assert_eq!(cr.head_ref, "feature/widgets");
    }

    #[test]
    fn pull_request_without_head_is_decode_error() {
        let id = ChangeRequestId::new("acme/widgets", 5);
        let err = parse_change_request(&id, &json!({"state": "open"})).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn run_conclusion_ignored_until_completed() {
        let v = json!({
            "id": 11, "name": "CI", "status": "in_progress", "conclusion": "failure",
            "head_sha": "abc", "html_url": "u", "run_number": 3, "run_attempt": 2
        });
        let run = parse_run(&v).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.conclusion, None);
        assert_eq!(run.run_attempt, 2);
    }

    #[test]
    fn job_collects_failed_steps_in_order() {
        let v = json!({
            "id": 77, "name": "test (ubuntu)", "status": "completed", "conclusion": "failure",
            "html_url": "https://github.com/acme/widgets/actions/runs/11/job/77",
            "steps": [
                {"name": "Checkout", "number": 1, "status": "completed", "conclusion": "success"},
                {"name": "Run tests", "number": 2, "status": "completed", "conclusion": "failure",
                 "started_at": "2026-10-19T10:00:00Z", "completed_at": "2026-10-19T10:02:00Z"},
                {"name": "Upload", "number": 3, "status": "completed", "conclusion": "failure"}
            ]
        });
        let job = parse_job(11, &v).unwrap();
        assert!(job.is_failed());
        assert_eq!(job.run_provider_id, 11);
        assert_eq!(job.failed_steps.len(), 2);
        assert_eq!(job.error_message.as_deref(), Some("Run tests"));
        assert!(job.failed_steps[0].started_at.is_some());
    }

    #[test]
    fn comment_without_id_is_skipped() {
        assert!(parse_comment(&json!({"body": "x"}), CommentKind::General).is_none());
        let c = parse_comment(
            &json!({"id": 3, "body": "nit", "path": "src/lib.rs", "user": {"login": "octo"}}),
            CommentKind::Review,
        )
        .unwrap();
        assert_eq!(c.author, "octo");
        assert_eq!(c.path.as_deref(), Some("src/lib.rs"));
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let e = classify_status(StatusCode::UNAUTHORIZED, false, "u", "bad creds".into());
        assert!(e.is_auth());
        let e = classify_status(StatusCode::FORBIDDEN, true, "u", String::new());
        assert!(matches!(e, FetchError::Transient(_)));
        let e = classify_status(StatusCode::NOT_FOUND, false, "u", String::new());
        assert!(matches!(e, FetchError::NotFound(_)));
        let e = classify_status(StatusCode::BAD_GATEWAY, false, "u", String::new());
        assert!(matches!(e, FetchError::Transient(_)));
    }
}
