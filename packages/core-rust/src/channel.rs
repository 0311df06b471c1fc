//! Channel naming for request/response correlation over pub/sub subjects.
//!
//! Every operation (pattern) owns one well-known request channel, `<op>_ack`,
//! and every in-flight call gets its own response channel,
//! `<op>_<request id>_res`. Both mappings are pure; the ack mapping is
//! reversible by stripping exactly one trailing `_ack`.

/// Suffix appended to an operation name to form its request channel.
pub const ACK_SUFFIX: &str = "_ack";

/// Suffix appended to form a per-call response channel.
pub const RES_SUFFIX: &str = "_res";

/// Errors produced while deriving or validating channel names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {channel:?} is not an ack channel")]
    NotAckChannel { channel: String },
    #[error("operation name must not be empty")]
    EmptyOperation,
    #[error("operation name {name:?} contains invalid character {ch:?}")]
    InvalidCharacter { name: String, ch: char },
}

/// Returns the channel on which requests for `operation` are received.
#[must_use]
pub fn ack_channel(operation: &str) -> String {
    format!("{operation}{ACK_SUFFIX}")
}

/// Returns the channel on which responses for one call are published.
///
/// Distinct request ids always produce distinct channels for the same
/// operation.
#[must_use]
pub fn response_channel(operation: &str, request_id: &str) -> String {
    format!("{operation}_{request_id}{RES_SUFFIX}")
}

/// Recovers the operation name from an ack channel.
///
/// Only a single trailing `_ack` is removed, so `jobs_ack_ack` resolves to
/// `jobs_ack`.
///
/// # Errors
///
/// Returns `ChannelError::NotAckChannel` if `channel` does not end in `_ack`.
pub fn operation_from_ack_channel(channel: &str) -> Result<&str, ChannelError> {
    channel
        .strip_suffix(ACK_SUFFIX)
        .ok_or_else(|| ChannelError::NotAckChannel {
            channel: channel.to_string(),
        })
}

/// Checks that `name` can be used as an operation name.
///
/// Names must be non-empty and must not contain whitespace or the subject
/// wildcards `*` and `>`, which brokers reject in published subjects.
///
/// # Errors
///
/// Returns `ChannelError::EmptyOperation` or `ChannelError::InvalidCharacter`.
pub fn validate_operation_name(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::EmptyOperation);
    }
    if let Some(ch) = name
        .chars()
        .find(|c| c.is_whitespace() || *c == '*' || *c == '>')
    {
        return Err(ChannelError::InvalidCharacter {
            name: name.to_string(),
            ch,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ack_channel_appends_suffix() {
        assert_eq!(ack_channel("greet"), "greet_ack");
    }

    #[test]
    fn response_channel_embeds_request_id() {
        assert_eq!(response_channel("greet", "42"), "greet_42_res");
    }

    #[test]
    fn operation_from_ack_channel_strips_suffix() {
        assert_eq!(operation_from_ack_channel("greet_ack").unwrap(), "greet");
    }

    #[test]
    fn operation_from_ack_channel_strips_only_one_suffix() {
        assert_eq!(
            operation_from_ack_channel("jobs_ack_ack").unwrap(),
            "jobs_ack"
        );
    }

    #[test]
    fn operation_from_non_ack_channel_fails() {
        let err = operation_from_ack_channel("greet_42_res").unwrap_err();
        assert_eq!(
            err,
            ChannelError::NotAckChannel {
                channel: "greet_42_res".to_string()
            }
        );
    }

    #[test]
    fn bare_suffix_resolves_to_empty_operation() {
        assert_eq!(operation_from_ack_channel("_ack").unwrap(), "");
    }

    #[test]
    fn validate_accepts_dotted_and_underscored_names() {
        assert!(validate_operation_name("math.sum").is_ok());
        assert!(validate_operation_name("user_get").is_ok());
    }

    #[test]
    fn validate_rejects_empty_name() {
        assert_eq!(
            validate_operation_name(""),
            Err(ChannelError::EmptyOperation)
        );
    }

    #[test]
    fn validate_rejects_wildcards_and_whitespace() {
        for (name, ch) in [("a*", '*'), ("a>b", '>'), ("a b", ' '), ("a\tb", '\t')] {
            assert_eq!(
                validate_operation_name(name),
                Err(ChannelError::InvalidCharacter {
                    name: name.to_string(),
                    ch
                })
            );
        }
    }

    proptest! {
        #[test]
        fn ack_channel_round_trips(op in "[a-zA-Z0-9_.-]{1,24}") {
            let channel = ack_channel(&op);
            prop_assert_eq!(operation_from_ack_channel(&channel).unwrap(), op.as_str());
        }

        #[test]
        fn distinct_ids_give_distinct_response_channels(
            op in "[a-z_.]{1,12}",
            id1 in "[a-zA-Z0-9-]{1,16}",
            id2 in "[a-zA-Z0-9-]{1,16}",
        ) {
            prop_assume!(id1 != id2);
            prop_assert_ne!(response_channel(&op, &id1), response_channel(&op, &id2));
        }
    }
}
