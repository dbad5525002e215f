//! Wire channel naming.
//!
//! Every event travels on `<prefix>events:<event>`; a wildcard subscription
//! covers `<prefix>events:*`.

/// Reserved segment between the prefix and the event name.
pub const EVENTS_SEGMENT: &str = "events:";

/// Build the wire channel for an event.
pub fn to_channel(prefix: &str, event: &str) -> String {
    format!("{}{}{}", prefix, EVENTS_SEGMENT, event)
}

/// Recover the event name from a wire channel.
///
/// Returns `None` when the channel does not belong to `prefix`.
pub fn from_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel.strip_prefix(prefix)?.strip_prefix(EVENTS_SEGMENT)
}

/// Channel naming bound to one bus prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNaming {
    prefix: String,
}

impl ChannelNaming {
    /// Create naming for a prefix (may be empty).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wire channel for an event.
    pub fn to_channel(&self, event: &str) -> String {
        to_channel(&self.prefix, event)
    }

    /// Event name carried by a wire channel.
    pub fn from_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        from_channel(&self.prefix, channel)
    }

    /// Pattern matching every event channel under the prefix.
    pub fn pattern(&self) -> String {
        format!("{}{}*", self.prefix, EVENTS_SEGMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_format() {
        assert_eq!(to_channel("global-", "ping"), "global-events:ping");
        assert_eq!(to_channel("", "ping"), "events:ping");
        assert_eq!(ChannelNaming::new("relay:").pattern(), "relay:events:*");
    }

    #[test]
    fn test_channel_invertible() {
        let prefixes = ["", "global-", "app:", "événements-"];
        let events = ["ping", "user.created", "a:b", "", "日本"];

        for prefix in prefixes {
            let naming = ChannelNaming::new(prefix);
            for event in events {
                let channel = naming.to_channel(event);
                assert_eq!(naming.from_channel(&channel), Some(event));
            }
        }
    }

    #[test]
    fn test_foreign_channel() {
        let naming = ChannelNaming::new("global-");
        assert_eq!(naming.from_channel("other-events:ping"), None);
        assert_eq!(naming.from_channel("global-stream:ping"), None);
        assert_eq!(naming.from_channel("global-"), None);
    }
}
