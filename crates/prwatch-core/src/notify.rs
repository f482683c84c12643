use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    fn pushover_level(&self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::High => 1,
        }
    }
}

/// Delivers a push notification to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, body: &str, priority: Priority) -> Result<()>;
}

/// Pushover backend. A no-op when either credential is empty.
pub struct Pushover {
    token: String,
    user: String,
    client: Client,
}

impl Pushover {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
            client: Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty() && !self.user.is_empty()
    }
}

#[async_trait]
impl Notifier for Pushover {
    async fn send(&self, title: &str, body: &str, priority: Priority) -> Result<()> {
        if !self.is_enabled() {
            debug!(title, "pushover credentials absent, skipping notification");
            return Ok(());
        }
        let level = priority.pushover_level().to_string();
        let form = [
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("title", title),
            ("message", body),
            ("priority", level.as_str()),
        ];
        self.client
            .post(PUSHOVER_URL)
            .form(&form)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .context("pushover request")?
            .error_for_status()
            .context("pushover rejected notification")?;
        info!(title, priority = ?priority, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_pushover_is_silent_noop() {
        let p = Pushover::new("", "user");
        assert!(!p.is_enabled());
        p.send("t", "b", Priority::High).await.unwrap();
    }

    #[test]
    fn priority_levels() {
        assert_eq!(Priority::Normal.pushover_level(), 0);
        assert_eq!(Priority::High.pushover_level(), 1);
    }
}
