use crate::InstanceId;

/// Key layout of one service in the coordination store
///
/// ```text
/// /bots/{service}/leader
/// /bots/{service}/offset
/// /bots/{service}/health/{instance_id}
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keys {
    root: String,
}

impl Keys {
    pub const ROOT: &'static str = "/bots";

    pub fn new(service: &str) -> Self {
        Self {
            root: format!("{}/{service}", Self::ROOT),
        }
    }

    /// Single well-known key holding the [`crate::LeaderRecord`]
    pub fn leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    /// Key holding the [`crate::OffsetRecord`]
    pub fn offset(&self) -> String {
        format!("{}/offset", self.root)
    }

    /// Prefix under which every instance publishes its [`crate::HealthRecord`]
    pub fn health_prefix(&self) -> String {
        format!("{}/health/", self.root)
    }

    pub fn health(&self, instance_id: &InstanceId) -> String {
        format!("{}{}", self.health_prefix(), instance_id)
    }

    /// Default service name derived from a bot token
    ///
    /// Uses the last 10 characters, so the token itself never ends up in
    /// the store.
    pub fn service_for_token(token: &str) -> String {
        let tail_start = token
            .char_indices()
            .rev()
            .nth(9)
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("telegram_bot_{}", &token[tail_start..])
    }
}

#[test]
fn key_layout() {
    let keys = Keys::new("svc");
    assert_eq!(keys.leader(), "/bots/svc/leader");
    assert_eq!(keys.offset(), "/bots/svc/offset");
    assert_eq!(keys.health_prefix(), "/bots/svc/health/");
    assert_eq!(
        keys.health(&InstanceId::from("abc")),
        "/bots/svc/health/abc"
    );
}

#[test]
fn service_name_from_token() {
    assert_eq!(
        Keys::service_for_token("123456:ABCDEFGHIJKLMNOP"),
        "telegram_bot_GHIJKLMNOP"
    );
    assert_eq!(Keys::service_for_token("short"), "telegram_bot_short");
}
