/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Forum API access. Network failures, timeouts and unparseable bodies
//! all collapse to status 0; the schedulers key off status codes, never
//! transport errors.

use async_trait::async_trait;
use lurkbot_protocol::{
    CurrentUserEnvelope, LatestPage, PostErrorBody, TopicDetail, UserActionsPage,
};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub const FETCH_TIMEOUT_MS: u64 = 8000;

#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    /// HTTP status; 0 means the request never produced a usable response.
    pub status: u16,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn failed() -> Self {
        Self {
            status: 0,
            data: None,
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct PostOutcome {
    pub ok: bool,
    pub status: u16,
    pub payload: Option<PostErrorBody>,
}

/// The JSON API surface the duties consume.
#[async_trait]
pub trait ForumApi: Send + Sync {
    /// One page of the latest-topics listing. `url` may be relative (a
    /// `more_topics_url` cursor) or absolute.
    async fn fetch_latest(&self, url: &str) -> ApiResponse<LatestPage>;

    async fn fetch_topic_detail(&self, topic_id: i64) -> ApiResponse<TopicDetail>;

    async fn fetch_current_user(&self) -> ApiResponse<CurrentUserEnvelope>;

    async fn fetch_user_actions(&self, username: &str, offset: u32) -> ApiResponse<UserActionsPage>;

    async fn post_reply(&self, topic_id: i64, raw: &str, csrf_token: &str) -> PostOutcome;
}

/// The rendered-page surface: link harvesting and scrolling for the
/// fallback queue build, plus the ambient bits only a live session sees
/// (avatar, CSRF token, current location).
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn collect_topic_links(&self) -> anyhow::Result<Vec<String>>;

    async fn scroll_once(&self) -> anyhow::Result<()>;

    async fn avatar_src(&self) -> anyhow::Result<Option<String>>;

    async fn csrf_token(&self) -> anyhow::Result<Option<String>>;

    async fn current_url(&self) -> anyhow::Result<String>;

    async fn navigate(&self, url: &str) -> anyhow::Result<()>;
}

/// Normalize a listing URL into its JSON API form: resolve against the
/// base, strip a trailing slash, append `.json` to the path when missing.
/// The query string (page cursors) is preserved.
pub fn ensure_json_api_url(url: &str, base: &Url) -> anyhow::Result<String> {
    let mut resolved = base.join(url)?;
    let path = resolved.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        resolved.set_path("/latest.json");
    } else if !path.ends_with(".json") {
        resolved.set_path(&format!("{path}.json"));
    } else {
        resolved.set_path(&path);
    }
    Ok(resolved.to_string())
}

#[derive(Clone)]
pub struct HttpForumClient {
    base: Url,
    http: reqwest::Client,
}

impl HttpForumClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .build()?;
        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> ApiResponse<T> {
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(%url, "request failed: {e}");
                return ApiResponse::failed();
            }
        };
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return ApiResponse { status, data: None };
        }
        match resp.json::<T>().await {
            Ok(data) => ApiResponse {
                status,
                data: Some(data),
            },
            Err(e) => {
                debug!(%url, "body parse failed: {e}");
                ApiResponse::failed()
            }
        }
    }
}

#[async_trait]
impl ForumApi for HttpForumClient {
    async fn fetch_latest(&self, url: &str) -> ApiResponse<LatestPage> {
        let api_url = match ensure_json_api_url(url, &self.base) {
            Ok(u) => u,
            Err(e) => {
                debug!(%url, "bad listing url: {e}");
                return ApiResponse::failed();
            }
        };
        self.get_json(api_url).await
    }

    async fn fetch_topic_detail(&self, topic_id: i64) -> ApiResponse<TopicDetail> {
        let url = format!(
            "{}/t/{topic_id}.json?track_visit=true&forceLoad=true",
            self.base.as_str().trim_end_matches('/')
        );
        self.get_json(url).await
    }

    async fn fetch_current_user(&self) -> ApiResponse<CurrentUserEnvelope> {
        let url = format!(
            "{}/session/current.json",
            self.base.as_str().trim_end_matches('/')
        );
        self.get_json(url).await
    }

    async fn fetch_user_actions(&self, username: &str, offset: u32) -> ApiResponse<UserActionsPage> {
        let url = format!(
            "{}/user_actions.json?offset={offset}&username={}&filter=5",
            self.base.as_str().trim_end_matches('/'),
            urlencoding::encode(username)
        );
        self.get_json(url).await
    }

    async fn post_reply(&self, topic_id: i64, raw: &str, csrf_token: &str) -> PostOutcome {
        let url = format!("{}/posts.json", self.base.as_str().trim_end_matches('/'));
        let form = [("topic_id", topic_id.to_string()), ("raw", raw.to_string())];
        let resp = match self
            .http
            .post(&url)
            .header("X-CSRF-Token", csrf_token)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(topic_id, "reply post failed: {e}");
                return PostOutcome {
                    ok: false,
                    status: 0,
                    payload: None,
                };
            }
        };
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            return PostOutcome {
                ok: true,
                status,
                payload: None,
            };
        }
        // Failure bodies carry the classification material.
        let payload = resp.json::<PostErrorBody>().await.ok();
        PostOutcome {
            ok: false,
            status,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://forum.example.com").unwrap()
    }

    #[test]
    fn json_url_appends_suffix_and_keeps_query() {
        let b = base();
        assert_eq!(
            ensure_json_api_url("/latest", &b).unwrap(),
            "https://forum.example.com/latest.json"
        );
        assert_eq!(
            ensure_json_api_url("/latest/", &b).unwrap(),
            "https://forum.example.com/latest.json"
        );
        assert_eq!(
            ensure_json_api_url("/latest?no_definitions=true&page=1", &b).unwrap(),
            "https://forum.example.com/latest.json?no_definitions=true&page=1"
        );
        assert_eq!(
            ensure_json_api_url("/latest.json?page=2", &b).unwrap(),
            "https://forum.example.com/latest.json?page=2"
        );
    }

    #[test]
    fn json_url_resolves_relative_and_absolute() {
        let b = base();
        assert_eq!(
            ensure_json_api_url("https://other.example.com/latest?page=3", &b).unwrap(),
            "https://other.example.com/latest.json?page=3"
        );
        assert_eq!(
            ensure_json_api_url("/", &b).unwrap(),
            "https://forum.example.com/latest.json"
        );
    }

    #[test]
    fn api_response_ok_range() {
        let ok = ApiResponse::<()> {
            status: 204,
            data: None,
        };
        assert!(ok.ok());
        assert!(!ApiResponse::<()>::failed().ok());
        let nf = ApiResponse::<()> {
            status: 404,
            data: None,
        };
        assert!(!nf.ok());
    }
}
