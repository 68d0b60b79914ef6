//! Message retention: expire stale queue claims and close old channel
//! messages.
//!
//! Queue messages carry a claim (`claim.*` metadata) that a worker takes and
//! is expected to either acknowledge or release; expiring a claim clears the
//! fields but never deletes the message. Channel messages are broadcast and
//! simply age out.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::issue::{IssueFilter, IssueRecord, TYPE_MESSAGE};

use super::action::GcAction;
use super::engine::{GcEngine, GcReport};

pub const LABEL_QUEUE: &str = "msg:queue";
pub const LABEL_CHANNEL: &str = "msg:channel";

pub const KEY_CLAIMED_BY: &str = "claim.claimed_by";
pub const KEY_CLAIMED_AT: &str = "claim.claimed_at";
pub const KEY_MESSAGE_EXPIRES_AT: &str = "message.expires_at";

impl GcEngine {
    pub(super) async fn scan_messages(
        &self,
        now: DateTime<Utc>,
        report: &mut GcReport,
    ) -> Result<()> {
        let messages = self.store.list(&IssueFilter::by_type(TYPE_MESSAGE)).await?;
        let claim_window = Duration::seconds(self.config.queue_claim_secs as i64);
        let retention = Duration::seconds(self.config.message_retention_secs as i64);

        for message in messages {
            if queue_claim_expired(&message, now, claim_window) {
                report.push(GcAction::ExpireQueueClaim {
                    message_id: message.id.clone(),
                    claimed_by: message.meta(KEY_CLAIMED_BY),
                });
            }

            if let Some(reason) = channel_expiry(&message, now, retention) {
                report.push(GcAction::CloseExpiredMessage {
                    message_id: message.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

fn queue_claim_expired(message: &IssueRecord, now: DateTime<Utc>, window: Duration) -> bool {
    message.has_label(LABEL_QUEUE)
        && message
            .meta_time(KEY_CLAIMED_AT)
            .is_some_and(|claimed_at| now.signed_duration_since(claimed_at) > window)
}

/// Why a channel message should close now, if it should. An explicit expiry
/// always wins over the creation-time retention window.
fn channel_expiry(message: &IssueRecord, now: DateTime<Utc>, retention: Duration) -> Option<String> {
    if !message.has_label(LABEL_CHANNEL) {
        return None;
    }

    if let Some(expires) = message.meta_time(KEY_MESSAGE_EXPIRES_AT) {
        if expires <= now {
            return Some(format!("explicit expiry {} passed", expires.to_rfc3339()));
        }
        return None;
    }

    let created = message.created_at?;
    if now.signed_duration_since(created) > retention {
        return Some(format!(
            "older than the {}h retention window",
            retention.num_hours()
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::meta_upsert;

    fn message(labels: &[&str], meta: &[(&str, String)]) -> IssueRecord {
        let mut description = String::new();
        for (key, value) in meta {
            description = meta_upsert(&description, key, value);
        }
        IssueRecord {
            id: "M1".to_string(),
            issue_type: Some(TYPE_MESSAGE.to_string()),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            description,
            ..Default::default()
        }
    }

    #[test]
    fn old_queue_claim_expires() {
        let now = Utc::now();
        let msg = message(
            &[LABEL_QUEUE],
            &[
                (KEY_CLAIMED_BY, "agent-1".to_string()),
                (KEY_CLAIMED_AT, (now - Duration::hours(2)).to_rfc3339()),
            ],
        );
        assert!(queue_claim_expired(&msg, now, Duration::hours(1)));
        assert!(!queue_claim_expired(&msg, now, Duration::hours(3)));
    }

    #[test]
    fn unclaimed_queue_message_never_expires_a_claim() {
        let msg = message(&[LABEL_QUEUE], &[]);
        assert!(!queue_claim_expired(&msg, Utc::now(), Duration::hours(1)));
    }

    #[test]
    fn explicit_expiry_wins_over_retention() {
        let now = Utc::now();
        let mut msg = message(
            &[LABEL_CHANNEL],
            &[(
                KEY_MESSAGE_EXPIRES_AT,
                (now + Duration::hours(1)).to_rfc3339(),
            )],
        );
        // Ancient creation date, but the explicit expiry is still ahead.
        msg.created_at = Some(now - Duration::days(30));
        assert_eq!(channel_expiry(&msg, now, Duration::days(7)), None);

        let expired = message(
            &[LABEL_CHANNEL],
            &[(
                KEY_MESSAGE_EXPIRES_AT,
                (now - Duration::hours(1)).to_rfc3339(),
            )],
        );
        assert!(channel_expiry(&expired, now, Duration::days(7)).is_some());
    }

    #[test]
    fn retention_window_applies_without_explicit_expiry() {
        let now = Utc::now();
        let mut msg = message(&[LABEL_CHANNEL], &[]);
        msg.created_at = Some(now - Duration::days(10));
        assert!(channel_expiry(&msg, now, Duration::days(7)).is_some());

        msg.created_at = Some(now - Duration::days(3));
        assert_eq!(channel_expiry(&msg, now, Duration::days(7)), None);
    }

    #[test]
    fn queue_labels_do_not_age_out_as_channels() {
        let now = Utc::now();
        let mut msg = message(&[LABEL_QUEUE], &[]);
        msg.created_at = Some(now - Duration::days(30));
        assert_eq!(channel_expiry(&msg, now, Duration::days(7)), None);
    }
}
