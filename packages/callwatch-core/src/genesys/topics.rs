//! Topic discovery for notification subscriptions.
//!
//! Lists routing queues and users via the provider API and emits canonical
//! conversation topic strings. Discovery is bounded by page size, optional
//! name filters, and a hard topic cap.

use serde::Deserialize;

use crate::config::TopicBuilderConfig;
use crate::error::{CallwatchError, CallwatchResult};

#[derive(Debug, Deserialize)]
struct EntityPage {
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default, rename = "pageCount")]
    page_count: u32,
}

#[derive(Debug, Deserialize)]
struct Entity {
    id: String,
    #[serde(default)]
    name: String,
}

/// Builds subscription topics from discovered queues and users.
pub struct TopicBuilder {
    client: reqwest::Client,
    api_base_url: String,
    config: TopicBuilderConfig,
}

impl TopicBuilder {
    /// Creates a builder over the provider REST API.
    pub fn new(client: reqwest::Client, api_base_url: String, config: TopicBuilderConfig) -> Self {
        Self {
            client,
            api_base_url,
            config,
        }
    }

    /// Discovers entities and emits canonical topic strings.
    ///
    /// The result is capped at `max_topics`; anything dropped by the cap is
    /// logged so a silent truncation never looks like full coverage.
    pub async fn build(&self, bearer: &str) -> CallwatchResult<Vec<String>> {
        let mut topics = Vec::new();

        if self.config.include_queues {
            let queues = self
                .list_entities(bearer, "/api/v2/routing/queues", &self.config.queue_filter)
                .await?;
            log::info!("[TopicBuilder] Discovered {} queue(s)", queues.len());
            topics.extend(
                queues
                    .iter()
                    .map(|q| format!("v2.routing.queues.{}.conversations", q.id)),
            );
        }

        if self.config.include_users {
            let users = self
                .list_entities(bearer, "/api/v2/users", &self.config.user_filter)
                .await?;
            log::info!("[TopicBuilder] Discovered {} user(s)", users.len());
            topics.extend(
                users
                    .iter()
                    .map(|u| format!("v2.users.{}.conversations", u.id)),
            );
        }

        if topics.len() > self.config.max_topics {
            log::warn!(
                "[TopicBuilder] Capping {} topic(s) to {}; {} dropped",
                topics.len(),
                self.config.max_topics,
                topics.len() - self.config.max_topics
            );
            topics.truncate(self.config.max_topics);
        }

        Ok(topics)
    }

    /// Pages through a list endpoint, applying the optional name filter.
    async fn list_entities(
        &self,
        bearer: &str,
        path: &str,
        name_filter: &str,
    ) -> CallwatchResult<Vec<Entity>> {
        let mut entities = Vec::new();
        let mut page_number = 1u32;

        loop {
            let mut request = self
                .client
                .get(format!("{}{}", self.api_base_url, path))
                .bearer_auth(bearer)
                .query(&[
                    ("pageSize", self.config.page_size.to_string()),
                    ("pageNumber", page_number.to_string()),
                ]);
            if !name_filter.is_empty() {
                request = request.query(&[("name", format!("{}*", name_filter))]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| CallwatchError::Upstream(format!("list {} failed: {}", path, e)))?;
            let status = response.status();
            if status.as_u16() == 401 {
                return Err(CallwatchError::Auth(format!(
                    "list {} rejected with HTTP 401",
                    path
                )));
            }
            if !status.is_success() {
                return Err(CallwatchError::Upstream(format!(
                    "list {} returned HTTP {}",
                    path, status
                )));
            }

            let page: EntityPage = response.json().await.map_err(|e| {
                CallwatchError::Protocol(format!("malformed entity page: {}", e))
            })?;
            let page_count = page.page_count;
            let got = page.entities.len();
            entities.extend(page.entities);

            // Stop on the last page, an empty page, or once the cap is
            // unreachable anyway.
            if got == 0 || page_number >= page_count || entities.len() >= self.config.max_topics {
                break;
            }
            page_number += 1;
        }

        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_page_parses_provider_shape() {
        let raw = r#"{
            "entities": [
                {"id": "q-1", "name": "Billing"},
                {"id": "q-2", "name": "Support"}
            ],
            "pageCount": 3,
            "pageNumber": 1
        }"#;
        let page: EntityPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.page_count, 3);
        assert_eq!(page.entities[0].id, "q-1");
        assert_eq!(page.entities[1].name, "Support");
    }

    #[test]
    fn topic_strings_are_canonical() {
        let topic = format!("v2.routing.queues.{}.conversations", "q-1");
        assert_eq!(topic, "v2.routing.queues.q-1.conversations");
        let topic = format!("v2.users.{}.conversations", "u-9");
        assert_eq!(topic, "v2.users.u-9.conversations");
    }
}
