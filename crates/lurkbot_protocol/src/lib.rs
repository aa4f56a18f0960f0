/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types for the Discourse-style forum API consumed by lurkbot_core.
//! Everything is lenient: missing or oddly shaped fields deserialize to
//! defaults instead of failing the whole page.

use serde::{Deserialize, Serialize};

/// A tag on a topic stub. Listings emit either bare strings or
/// `{ name, slug }` objects depending on the site's tagging setup.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TagRef {
    Name(String),
    Full {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        slug: Option<String>,
    },
}

impl TagRef {
    /// Normalized lowercase values this tag answers to.
    pub fn values(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self {
            TagRef::Name(s) => push_norm(&mut out, s),
            TagRef::Full { name, slug } => {
                if let Some(n) = name {
                    push_norm(&mut out, n);
                }
                if let Some(s) = slug {
                    push_norm(&mut out, s);
                }
            }
        }
        out
    }
}

fn push_norm(out: &mut Vec<String>, raw: &str) {
    let t = raw.trim();
    if !t.is_empty() {
        out.push(t.to_lowercase());
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TopicStub {
    pub id: i64,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRef>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TopicStub {
    /// Relative topic URL, `/t/<slug>/<id>` when the slug is known.
    pub fn url(&self) -> String {
        match self.slug.as_deref().map(str::trim) {
            Some(slug) if !slug.is_empty() => format!("/t/{slug}/{}", self.id),
            _ => format!("/t/{}", self.id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TopicList {
    #[serde(default)]
    pub topics: Vec<TopicStub>,
    #[serde(default)]
    pub more_topics_url: Option<String>,
}

/// One page of the "latest topics" listing.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LatestPage {
    #[serde(default)]
    pub topic_list: Option<TopicList>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PostStub {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub post_number: Option<i64>,
    /// Set by the server when the post belongs to the requesting session.
    #[serde(default)]
    pub yours: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PostStream {
    #[serde(default)]
    pub posts: Vec<PostStub>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TopicDetails {
    #[serde(default)]
    pub can_create_post: Option<bool>,
}

/// Full thread detail for a single topic.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TopicDetail {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub details: Option<TopicDetails>,
    #[serde(default)]
    pub post_stream: Option<PostStream>,
}

impl TopicDetail {
    /// True when any post in the stream belongs to the viewer.
    pub fn viewer_has_posted(&self, user_id: Option<i64>) -> bool {
        let posts = match &self.post_stream {
            Some(s) => &s.posts,
            None => return false,
        };
        if posts.iter().any(|p| p.yours) {
            return true;
        }
        match user_id {
            Some(uid) => posts.iter().any(|p| p.user_id == Some(uid)),
            None => false,
        }
    }

    /// False when the topic is closed, archived or posting is disallowed.
    pub fn posting_allowed(&self) -> bool {
        if self.closed || self.archived {
            return false;
        }
        !matches!(
            self.details.as_ref().and_then(|d| d.can_create_post),
            Some(false)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UserRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

/// `/session/current.json`. Some deployments nest under `current_user`,
/// others under `user`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CurrentUserEnvelope {
    #[serde(default)]
    pub current_user: Option<UserRef>,
    #[serde(default)]
    pub user: Option<UserRef>,
}

impl CurrentUserEnvelope {
    pub fn user_id(&self) -> Option<i64> {
        self.current_user
            .as_ref()
            .and_then(|u| u.id)
            .or_else(|| self.user.as_ref().and_then(|u| u.id))
    }

    pub fn username(&self) -> Option<String> {
        let pick = |u: &UserRef| {
            u.username
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        self.current_user
            .as_ref()
            .and_then(pick)
            .or_else(|| self.user.as_ref().and_then(pick))
    }
}

/// One entry of the user-activity ("replies I made") feed.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UserAction {
    #[serde(default)]
    pub topic_id: Option<i64>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub post_number: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UserActionsPage {
    #[serde(default)]
    pub user_actions: Vec<UserAction>,
}

/// Structured rejection body returned by the reply-post endpoint. Servers
/// scatter the human-readable reason across several fields.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PostErrorBody {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl PostErrorBody {
    /// All non-empty reason strings, in declaration order.
    pub fn reasons(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |s: &str| {
            let t = s.trim();
            if !t.is_empty() {
                out.push(t.to_string());
            }
        };
        for s in &self.errors {
            push(s);
        }
        for s in &self.messages {
            push(s);
        }
        if let Some(s) = &self.error {
            push(s);
        }
        if let Some(s) = &self.message {
            push(s);
        }
        if let Some(s) = &self.detail {
            push(s);
        }
        if let Some(s) = &self.error_type {
            push(s);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_ref_handles_both_shapes() {
        let page: TopicStub = serde_json::from_str(
            r#"{"id":7,"slug":"hello-world","tags":["抽奖",{"name":"Misc","slug":"misc"}]}"#,
        )
        .unwrap();
        let mut values: Vec<String> = page.tags.iter().flat_map(|t| t.values()).collect();
        values.sort();
        assert_eq!(values, vec!["misc", "misc", "抽奖"]);
        assert_eq!(page.url(), "/t/hello-world/7");
    }

    #[test]
    fn topic_url_without_slug() {
        let stub = TopicStub {
            id: 42,
            ..Default::default()
        };
        assert_eq!(stub.url(), "/t/42");
    }

    #[test]
    fn viewer_has_posted_matches_yours_and_user_id() {
        let detail: TopicDetail = serde_json::from_str(
            r#"{"post_stream":{"posts":[{"user_id":3,"post_number":1},{"user_id":9,"post_number":2}]}}"#,
        )
        .unwrap();
        assert!(detail.viewer_has_posted(Some(9)));
        assert!(!detail.viewer_has_posted(Some(4)));
        assert!(!detail.viewer_has_posted(None));

        let yours: TopicDetail =
            serde_json::from_str(r#"{"post_stream":{"posts":[{"yours":true}]}}"#).unwrap();
        assert!(yours.viewer_has_posted(None));
    }

    #[test]
    fn posting_allowed_respects_flags() {
        let open = TopicDetail::default();
        assert!(open.posting_allowed());

        let closed: TopicDetail = serde_json::from_str(r#"{"closed":true}"#).unwrap();
        assert!(!closed.posting_allowed());

        let locked: TopicDetail =
            serde_json::from_str(r#"{"details":{"can_create_post":false}}"#).unwrap();
        assert!(!locked.posting_allowed());
    }

    #[test]
    fn error_body_reasons_collects_all_fields() {
        let body: PostErrorBody = serde_json::from_str(
            r#"{"errors":["You have already replied"],"error_type":"rate_limit"}"#,
        )
        .unwrap();
        assert_eq!(body.reasons(), vec!["You have already replied", "rate_limit"]);
    }
}
