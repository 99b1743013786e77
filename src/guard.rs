//! Delivery guard: retains acks and final replies whose send failed.
//!
//! Entries are retried on the timer tick while their session is alive. A
//! reconnect marks them as belonging to the previous session; from then on
//! they are only replayed if the broker redelivers the same message-id.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::stomp::{OutboundAck, OutboundReply, ReplyKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub ack: OutboundAck,
    pub retry_count: u32,
    pub from_prev_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReply {
    pub reply: OutboundReply,
    pub retry_count: u32,
    pub from_prev_session: bool,
}

/// A delivery to re-issue on a retry tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    Reply(OutboundReply),
    Ack(OutboundAck),
}

/// What the guard held for a redelivered message-id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replay {
    pub reply: Option<OutboundReply>,
    pub had_ack: bool,
}

#[derive(Debug, Default)]
pub struct DeliveryGuard {
    /// 0 retries forever.
    max_retries: u32,
    acks: BTreeMap<String, PendingAck>,
    replies: BTreeMap<String, PendingReply>,
}

impl DeliveryGuard {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    fn exhausted(&self, retry_count: u32) -> bool {
        self.max_retries > 0 && retry_count > self.max_retries
    }

    pub fn ack_failed(&mut self, ack: OutboundAck, reason: &str) {
        let message_id = ack.message_id.clone();
        match self.acks.get(&message_id) {
            Some(entry) if self.exhausted(entry.retry_count) => {
                error!(
                    message_id = %message_id,
                    retries = entry.retry_count,
                    reason = %reason,
                    "CRITICAL: giving up on ack"
                );
                self.acks.remove(&message_id);
            }
            Some(entry) => {
                warn!(message_id = %message_id, retries = entry.retry_count, reason = %reason, "Ack retry failed");
            }
            None => {
                warn!(message_id = %message_id, reason = %reason, "Ack failed, will retry");
                self.acks.insert(
                    message_id,
                    PendingAck {
                        ack,
                        retry_count: 1,
                        from_prev_session: false,
                    },
                );
            }
        }
    }

    pub fn reply_failed(&mut self, reply: OutboundReply, reason: &str) {
        if reply.kind == ReplyKind::Interim {
            debug!(message_id = %reply.message_id, reason = %reason, "Interim status not delivered");
            return;
        }
        let message_id = reply.message_id.clone();
        match self.replies.get(&message_id) {
            Some(entry) if self.exhausted(entry.retry_count) => {
                error!(
                    message_id = %message_id,
                    retries = entry.retry_count,
                    reason = %reason,
                    "CRITICAL: giving up on reply"
                );
                self.replies.remove(&message_id);
            }
            Some(entry) => {
                warn!(message_id = %message_id, retries = entry.retry_count, reason = %reason, "Reply retry failed");
            }
            None => {
                warn!(message_id = %message_id, reason = %reason, "Reply failed, will retry");
                self.replies.insert(
                    message_id,
                    PendingReply {
                        reply,
                        retry_count: 1,
                        from_prev_session: false,
                    },
                );
            }
        }
    }

    pub fn ack_delivered(&mut self, message_id: &str) -> bool {
        let removed = self.acks.remove(message_id).is_some();
        if removed {
            info!(message_id = %message_id, "Pending ack delivered");
        }
        removed
    }

    pub fn reply_delivered(&mut self, message_id: &str) -> bool {
        let removed = self.replies.remove(message_id).is_some();
        if removed {
            info!(message_id = %message_id, "Pending reply delivered");
        }
        removed
    }

    /// A new session is up: current entries can no longer be retried.
    pub fn mark_previous_session(&mut self) {
        for entry in self.acks.values_mut() {
            entry.from_prev_session = true;
        }
        for entry in self.replies.values_mut() {
            entry.from_prev_session = true;
        }
        if !self.is_empty() {
            info!(
                acks = self.acks.len(),
                replies = self.replies.len(),
                "Pending deliveries moved to previous session"
            );
        }
    }

    /// Deliveries to re-issue now, replies before acks.
    pub fn due_retries(&mut self) -> Vec<Retry> {
        let replies = self
            .replies
            .values_mut()
            .filter(|e| !e.from_prev_session)
            .map(|e| {
                e.retry_count += 1;
                Retry::Reply(e.reply.clone())
            });
        let mut due: Vec<Retry> = replies.collect();
        due.extend(
            self.acks
                .values_mut()
                .filter(|e| !e.from_prev_session)
                .map(|e| {
                    e.retry_count += 1;
                    Retry::Ack(e.ack.clone())
                }),
        );
        due
    }

    /// Remove and return what is held for a redelivered message-id.
    pub fn take_replay(&mut self, message_id: &str) -> Option<Replay> {
        let reply = self.replies.remove(message_id).map(|e| e.reply);
        let had_ack = self.acks.remove(message_id).is_some();
        (reply.is_some() || had_ack).then_some(Replay { reply, had_ack })
    }

    pub fn pending_ack(&self, message_id: &str) -> Option<&PendingAck> {
        self.acks.get(message_id)
    }

    pub fn pending_reply(&self, message_id: &str) -> Option<&PendingReply> {
        self.replies.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.acks.len() + self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.replies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::frame::HDR_MESSAGE_ID;
    use crate::stomp::{Command, Frame};

    fn ack(id: &str) -> OutboundAck {
        OutboundAck::new(id, Frame::new(Command::Message).with_header(HDR_MESSAGE_ID, id))
    }

    fn reply(id: &str, kind: ReplyKind) -> OutboundReply {
        OutboundReply {
            message_id: id.to_string(),
            destination: "/queue/acks.201.q".to_string(),
            correlation_id: Some("c1".to_string()),
            body: r#"{"message_type":0,"message":"done","complete":true}"#.to_string(),
            kind,
        }
    }

    #[test]
    fn test_failed_ack_is_retried_then_removed() {
        let mut guard = DeliveryGuard::new(3);
        guard.ack_failed(ack("m1"), "closed");
        assert_eq!(guard.pending_ack("m1").unwrap().retry_count, 1);

        assert_eq!(guard.due_retries(), vec![Retry::Ack(ack("m1"))]);
        assert_eq!(guard.pending_ack("m1").unwrap().retry_count, 2);

        assert!(guard.ack_delivered("m1"));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_replies_retry_before_acks() {
        let mut guard = DeliveryGuard::new(0);
        guard.ack_failed(ack("a"), "x");
        guard.reply_failed(reply("b", ReplyKind::Final), "x");
        let due = guard.due_retries();
        assert!(matches!(due[0], Retry::Reply(_)));
        assert!(matches!(due[1], Retry::Ack(_)));
    }

    #[test]
    fn test_interim_replies_are_not_guarded() {
        let mut guard = DeliveryGuard::new(3);
        guard.reply_failed(reply("m1", ReplyKind::Interim), "closed");
        assert!(guard.is_empty());
    }

    #[test]
    fn test_entry_dropped_after_max_retries() {
        let mut guard = DeliveryGuard::new(2);
        guard.ack_failed(ack("m1"), "closed");
        for _ in 0..2 {
            guard.due_retries();
            guard.ack_failed(ack("m1"), "closed");
        }
        // retry_count is now 3, above the bound of 2
        assert!(guard.pending_ack("m1").is_none());
    }

    #[test]
    fn test_unbounded_retries_keep_entry() {
        let mut guard = DeliveryGuard::new(0);
        guard.reply_failed(reply("m1", ReplyKind::Final), "closed");
        for _ in 0..50 {
            guard.due_retries();
            guard.reply_failed(reply("m1", ReplyKind::Final), "closed");
        }
        assert_eq!(guard.pending_reply("m1").unwrap().retry_count, 51);
    }

    #[test]
    fn test_previous_session_entries_are_not_retried() {
        let mut guard = DeliveryGuard::new(3);
        guard.ack_failed(ack("m1"), "closed");
        guard.mark_previous_session();
        assert!(guard.due_retries().is_empty());
        assert!(guard.pending_ack("m1").unwrap().from_prev_session);

        guard.ack_failed(ack("m2"), "closed");
        assert_eq!(guard.due_retries(), vec![Retry::Ack(ack("m2"))]);
    }

    #[test]
    fn test_take_replay_clears_entries() {
        let mut guard = DeliveryGuard::new(3);
        guard.reply_failed(reply("m1", ReplyKind::Final), "closed");
        guard.ack_failed(ack("m1"), "closed");
        guard.mark_previous_session();

        let replay = guard.take_replay("m1").unwrap();
        assert_eq!(replay.reply, Some(reply("m1", ReplyKind::Final)));
        assert!(replay.had_ack);
        assert!(guard.is_empty());
        assert!(guard.take_replay("m1").is_none());
    }
}
