//! Idempotency key derivation for deduplicating job admission
//!
//! Different ingress channels carry different natural dedup tokens: bot
//! channels have a platform-native message id, direct clients supply their
//! own request id. Both normalize to one `{channel}:{id}` key format so the
//! job record store can enforce uniqueness with a single constraint.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Separator between the channel segment and the id segment
const KEY_SEPARATOR: char = ':';

/// Ingress channel a job was submitted from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    TelegramBot,
    WhatsappBot,
    DiscordBot,
    WebApp,
    MobileApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::TelegramBot => "telegram_bot",
            Channel::WhatsappBot => "whatsapp_bot",
            Channel::DiscordBot => "discord_bot",
            Channel::WebApp => "web_app",
            Channel::MobileApp => "mobile_app",
        }
    }

    /// Bot channels key on the platform-native message id;
    /// direct-client channels key on a caller-supplied request id.
    pub fn requires_message_id(&self) -> bool {
        matches!(
            self,
            Channel::TelegramBot | Channel::WhatsappBot | Channel::DiscordBot
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "telegram_bot" => Ok(Channel::TelegramBot),
            "whatsapp_bot" => Ok(Channel::WhatsappBot),
            "discord_bot" => Ok(Channel::DiscordBot),
            "web_app" => Ok(Channel::WebApp),
            "mobile_app" => Ok(Channel::MobileApp),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown channel: {}", other),
            }),
        }
    }
}

/// Derive the stable idempotency key for a submission.
///
/// Fails with `InvalidInput` when the channel's required token is missing.
pub fn derive_key(
    channel: Channel,
    message_id: Option<&str>,
    client_request_id: Option<&str>,
) -> Result<String> {
    let id = if channel.requires_message_id() {
        message_id.ok_or_else(|| PipelineError::InvalidInput {
            message: format!("Channel {} requires a message id", channel),
        })?
    } else {
        client_request_id.ok_or_else(|| PipelineError::InvalidInput {
            message: format!("Channel {} requires a client request id", channel),
        })?
    };

    if id.is_empty() {
        return Err(PipelineError::InvalidInput {
            message: format!("Empty dedup token for channel {}", channel),
        });
    }

    Ok(format!("{}{}{}", channel, KEY_SEPARATOR, id))
}

/// Parse an idempotency key back into its channel and id segments.
pub fn parse_key(key: &str) -> Result<(Channel, String)> {
    let (channel, id) = key
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| PipelineError::InvalidInput {
            message: format!("Idempotency key has no separator: {}", key),
        })?;

    if id.is_empty() {
        return Err(PipelineError::InvalidInput {
            message: format!("Idempotency key has an empty id segment: {}", key),
        });
    }

    Ok((channel.parse()?, id.to_string()))
}

/// Cheap structural check used defensively before any store lookup.
pub fn is_valid_key(key: &str) -> bool {
    static KEY_PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = KEY_PATTERN
        .get_or_init(|| regex::Regex::new(r"^[a-z][a-z0-9_]*:.+$").expect("static key pattern"));
    pattern.is_match(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bot_channel_keys_on_message_id() {
        let key = derive_key(Channel::TelegramBot, Some("msg123"), None).unwrap();
        assert_eq!(key, "telegram_bot:msg123");
    }

    #[test]
    fn test_direct_channel_keys_on_client_request_id() {
        let key = derive_key(Channel::WebApp, None, Some("req-9f2")).unwrap();
        assert_eq!(key, "web_app:req-9f2");
    }

    #[test]
    fn test_missing_token_is_invalid_input() {
        let error = derive_key(Channel::TelegramBot, None, Some("req-9f2")).unwrap_err();
        assert_eq!(error.error_code(), "invalid_input");

        let error = derive_key(Channel::MobileApp, Some("msg123"), None).unwrap_err();
        assert_eq!(error.error_code(), "invalid_input");
    }

    #[test]
    fn test_parse_key_rejects_missing_separator() {
        assert!(parse_key("telegram_bot_msg123").is_err());
        assert!(parse_key("telegram_bot:").is_err());
    }

    #[test]
    fn test_key_validity_check() {
        assert!(is_valid_key("telegram_bot:msg123"));
        assert!(is_valid_key("web_app:req:with:colons"));
        assert!(!is_valid_key("no-separator"));
        assert!(!is_valid_key(":orphan-id"));
        assert!(!is_valid_key("telegram_bot:"));
    }

    proptest! {
        #[test]
        fn prop_derive_then_parse_round_trips(id in "[a-zA-Z0-9_-]{1,40}") {
            for channel in [
                Channel::TelegramBot,
                Channel::WhatsappBot,
                Channel::DiscordBot,
                Channel::WebApp,
                Channel::MobileApp,
            ] {
                let key = if channel.requires_message_id() {
                    derive_key(channel, Some(&id), None).unwrap()
                } else {
                    derive_key(channel, None, Some(&id)).unwrap()
                };
                prop_assert!(is_valid_key(&key));
                let (parsed_channel, parsed_id) = parse_key(&key).unwrap();
                prop_assert_eq!(parsed_channel, channel);
                prop_assert_eq!(parsed_id, id.clone());
            }
        }
    }
}
