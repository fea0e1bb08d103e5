//! Security alert scanner
//!
//! Looks at recent notifications from the platform's service account for
//! signs that someone is changing the account's credentials. Messages are
//! only read; nothing is acknowledged on the platform side.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::account::types::{AlertContext, SecurityAlert};
use crate::client::{PlatformError, SessionClient};

/// Only notifications younger than this are considered.
pub const ALERT_WINDOW_SECS: i64 = 48 * 3600;

/// Case-insensitive substrings, English and Russian.
pub const TRIGGER_WORDS: [&str; 15] = [
    "password",
    "recovery",
    "email",
    "пароль",
    "почта",
    "сброс",
    "код",
    "code",
    "reset",
    "изменение",
    "change",
    "login",
    "вход",
    "device",
    "устройство",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

impl ScanHit {
    pub fn into_alert(self, context: AlertContext, detected_at: DateTime<Utc>) -> SecurityAlert {
        SecurityAlert::new(self.text, context, detected_at)
    }
}

pub fn is_security_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRIGGER_WORDS.iter().any(|word| lower.contains(word))
}

/// First qualifying message in the most recent `limit` notifications.
pub async fn scan(
    client: &dyn SessionClient,
    phone: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Option<ScanHit>, PlatformError> {
    let window = Duration::seconds(ALERT_WINDOW_SECS);
    let messages = client.recent_service_messages(limit).await?;

    let hit = messages
        .into_iter()
        .find(|m| now - m.posted_at < window && is_security_text(&m.text))
        .map(|m| ScanHit { text: m.text, posted_at: m.posted_at });

    if let Some(hit) = &hit {
        let preview: String = hit.text.chars().take(100).collect();
        info!("Security alert found for {}: {}", phone, preview);
    }
    Ok(hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockPlatform;
    use crate::client::{ClientFactory, ClientParams, ServiceMessage};

    fn client(platform: &MockPlatform) -> Box<dyn SessionClient> {
        platform
            .build(ClientParams {
                phone: "+1".into(),
                api_id: 1,
                api_hash: "h".into(),
                session: Some(b"s".to_vec()),
                device: Default::default(),
                proxy: None,
            })
            .unwrap()
    }

    fn msg(text: &str, age_hours: i64, now: DateTime<Utc>) -> ServiceMessage {
        ServiceMessage { text: text.to_string(), posted_at: now - Duration::hours(age_hours) }
    }

    #[test]
    fn test_trigger_words_are_case_insensitive_and_bilingual() {
        assert!(is_security_text("Your LOGIN code is 12345"));
        assert!(is_security_text("Новый вход в аккаунт"));
        assert!(is_security_text("ПАРОЛЬ изменён"));
        assert!(!is_security_text("Welcome to the platform!"));
    }

    #[tokio::test]
    async fn test_first_recent_match_wins() {
        let now = Utc::now();
        let platform = MockPlatform::authorized();
        platform.with(|s| {
            s.service_messages = vec![
                msg("Weekly digest", 1, now),
                msg("Old password reset", 49, now),
                msg("New device logged in", 2, now),
                msg("Recovery email changed", 3, now),
            ]
        });
        let hit = scan(client(&platform).as_ref(), "+1", 20, now).await.unwrap().unwrap();
        assert_eq!(hit.text, "New device logged in");
    }

    #[tokio::test]
    async fn test_messages_outside_window_are_ignored() {
        let now = Utc::now();
        let platform = MockPlatform::authorized();
        platform.with(|s| s.service_messages = vec![msg("Login code 55555", 48, now)]);
        assert_eq!(scan(client(&platform).as_ref(), "+1", 20, now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_limit_bounds_the_window() {
        let now = Utc::now();
        let platform = MockPlatform::authorized();
        platform.with(|s| {
            s.service_messages = vec![msg("hello", 1, now), msg("login code", 1, now)];
        });
        assert_eq!(scan(client(&platform).as_ref(), "+1", 1, now).await.unwrap(), None);
        // Only a read was issued.
        assert_eq!(platform.calls(), vec!["recent_service_messages".to_string()]);
    }
}
