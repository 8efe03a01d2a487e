//! Group transfer fan-out
//!
//! Sends one file to several recipients at once. Every recipient gets its own
//! handshake, key material, and session task; one slow or failed recipient
//! never stalls the others.

use crate::error::{Error, Result};
use crate::session::{
    CancelToken, Progress, SessionConfig, SessionEvent, TransferSession, TransferStats,
};
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Longest accepted recipient identifier
pub const RECIPIENT_MAX_LEN: usize = 64;

/// Validate a recipient list before any network activity
///
/// Between 1 and `MAX_RECIPIENTS` names, each `[A-Za-z0-9._-]`, no
/// duplicates.
pub fn validate_recipients(recipients: &[String]) -> Result<()> {
    if recipients.is_empty() {
        return Err(Error::InvalidRecipient("recipient list is empty".into()));
    }
    if recipients.len() > crate::MAX_RECIPIENTS {
        return Err(Error::InvalidRecipient(format!(
            "{} recipients exceeds limit of {}",
            recipients.len(),
            crate::MAX_RECIPIENTS
        )));
    }
    for (position, recipient) in recipients.iter().enumerate() {
        if recipient.is_empty() || recipient.len() > RECIPIENT_MAX_LEN {
            return Err(Error::InvalidRecipient(format!(
                "recipient {} has invalid length {}",
                position,
                recipient.len()
            )));
        }
        if !recipient
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
        {
            return Err(Error::InvalidRecipient(format!(
                "recipient {:?} contains invalid characters",
                recipient
            )));
        }
        if recipients[..position].contains(recipient) {
            return Err(Error::InvalidRecipient(format!(
                "duplicate recipient {:?}",
                recipient
            )));
        }
    }
    Ok(())
}

/// Aggregate outcome of a group send
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GroupStatus {
    /// Every recipient completed
    Completed,
    /// At least one recipient completed, at least one did not
    Partial,
    /// No recipient completed
    Failed,
}

/// Per-recipient result of a group send
#[derive(Debug)]
pub struct RecipientOutcome {
    pub recipient: String,
    pub result: Result<TransferStats>,
}

/// Everything a finished group send reports
#[derive(Debug)]
pub struct GroupOutcome {
    pub status: GroupStatus,
    pub outcomes: Vec<RecipientOutcome>,
}

impl GroupOutcome {
    /// Recipients that completed
    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.recipient.as_str())
    }

    /// Recipients that failed, with their errors
    pub fn failed(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Ok(_) => None,
                Err(err) => Some((o.recipient.as_str(), err)),
            })
    }
}

/// Group-level tuning
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    /// Per-recipient session parameters
    pub session: SessionConfig,
    /// Total outbound budget in bytes/sec, split evenly across recipients
    pub total_bandwidth_limit: Option<u64>,
}

/// Mean completion across all legs, pollable from other tasks
#[derive(Debug, Clone, Default)]
pub struct GroupProgress {
    legs: Vec<Arc<Progress>>,
}

impl GroupProgress {
    /// Mean completed fraction across recipients, in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.legs.is_empty() {
            return 0.0;
        }
        self.legs.iter().map(|p| p.fraction()).sum::<f64>() / self.legs.len() as f64
    }

    /// Per-leg `(done, total)` chunk counts
    pub fn legs(&self) -> Vec<(u32, u32)> {
        self.legs.iter().map(|p| p.snapshot()).collect()
    }
}

/// One prepared group send
pub struct GroupSend<T: Transport> {
    sessions: Vec<(String, TransferSession<T>)>,
    progress: GroupProgress,
}

impl<T: Transport + Sync + 'static> GroupSend<T> {
    /// Validate the recipient list and prepare one session per recipient
    ///
    /// Each entry pairs a recipient identifier with an already-open transport
    /// to that recipient.
    pub fn new(peers: Vec<(String, T)>, config: &GroupConfig) -> Result<Self> {
        let names: Vec<String> = peers.iter().map(|(name, _)| name.clone()).collect();
        validate_recipients(&names)?;

        let per_recipient_limit = config
            .total_bandwidth_limit
            .map(|total| (total / peers.len() as u64).max(1));
        let mut sessions = Vec::with_capacity(peers.len());
        let mut legs = Vec::with_capacity(peers.len());
        for (name, transport) in peers {
            let mut session_config = config.session.clone();
            if per_recipient_limit.is_some() {
                session_config.bandwidth_limit = per_recipient_limit;
            }
            let session = TransferSession::new(transport, session_config);
            legs.push(session.progress());
            sessions.push((name, session));
        }
        Ok(Self {
            sessions,
            progress: GroupProgress { legs },
        })
    }

    /// Attach one event channel shared by every leg
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.sessions = self
            .sessions
            .into_iter()
            .map(|(name, session)| (name, session.with_events(events.clone())))
            .collect();
        self
    }

    /// Attach one cancel token shared by every leg
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.sessions = self
            .sessions
            .into_iter()
            .map(|(name, session)| (name, session.with_cancel(cancel.clone())))
            .collect();
        self
    }

    /// Aggregate progress handle, valid while `run` executes
    pub fn progress(&self) -> GroupProgress {
        self.progress.clone()
    }

    /// Send the file to every recipient concurrently
    ///
    /// Runs every leg to its own conclusion; the returned status is
    /// `Partial` when outcomes are mixed.
    pub async fn run(self, name: &str, data: Bytes) -> GroupOutcome {
        let file_name = name.to_string();
        let mut tasks = JoinSet::new();
        let recipient_count = self.sessions.len();
        for (position, (recipient, mut session)) in self.sessions.into_iter().enumerate() {
            let file_name = file_name.clone();
            let data = data.clone();
            tasks.spawn(async move {
                let result = session.send_file(&file_name, data).await;
                (position, recipient, result)
            });
        }

        let mut outcomes: Vec<Option<RecipientOutcome>> = Vec::new();
        outcomes.resize_with(recipient_count, || None);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, recipient, result)) => {
                    if let Err(err) = &result {
                        tracing::warn!(recipient = %recipient, %err, "group leg failed");
                    }
                    outcomes[position] = Some(RecipientOutcome { recipient, result });
                }
                Err(join_error) => {
                    tracing::error!(%join_error, "group leg panicked");
                }
            }
        }

        let outcomes: Vec<RecipientOutcome> = outcomes
            .into_iter()
            .flatten()
            .collect();
        let completed = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let status = if completed == recipient_count {
            GroupStatus::Completed
        } else if completed > 0 {
            GroupStatus::Partial
        } else {
            GroupStatus::Failed
        };
        metrics::counter!("pqdrop_group_sends_total", 1);
        tracing::info!(
            recipients = recipient_count,
            completed,
            status = ?status,
            "group send finished"
        );
        GroupOutcome { status, outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn test_config() -> GroupConfig {
        GroupConfig {
            session: SessionConfig {
                ack_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(5),
                chunk_size: Some(crate::MIN_CHUNK_SIZE),
                ..Default::default()
            },
            total_bandwidth_limit: None,
        }
    }

    fn test_payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_recipient_validation() {
        assert!(validate_recipients(&names(&["alice", "bob-2", "carol.d_1"])).is_ok());
        assert!(validate_recipients(&[]).is_err());
        assert!(validate_recipients(&names(&["alice", "alice"])).is_err());
        assert!(validate_recipients(&names(&["al ice"])).is_err());
        assert!(validate_recipients(&names(&["pär"])).is_err());
        assert!(validate_recipients(&names(&[""])).is_err());
        assert!(validate_recipients(&names(&[&"x".repeat(65)])).is_err());
        assert!(validate_recipients(&names(&[&"x".repeat(64)])).is_ok());

        let eleven: Vec<String> = (0..11).map(|i| format!("peer-{}", i)).collect();
        assert!(matches!(
            validate_recipients(&eleven),
            Err(Error::InvalidRecipient(_))
        ));
        let ten: Vec<String> = (0..10).map(|i| format!("peer-{}", i)).collect();
        assert!(validate_recipients(&ten).is_ok());
    }

    #[test]
    fn test_run_future_is_send() {
        fn require_send<F: Send>(_: &F) {}
        let (left, _right) = memory_pair(4);
        let group =
            GroupSend::new(vec![("alice".to_string(), left)], &test_config()).unwrap();
        // Legs run on spawned tasks, so the whole run future must be Send
        let fut = group.run("solo.bin", test_payload(16));
        require_send(&fut);
    }

    #[tokio::test]
    async fn test_group_send_all_complete() {
        let data = test_payload(crate::MIN_CHUNK_SIZE * 2);
        let mut peers = Vec::new();
        let mut receivers = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let (left, right) = memory_pair(64);
            peers.push((name.to_string(), left));
            let mut session = TransferSession::new(right, test_config().session);
            receivers.push(tokio::spawn(async move {
                session.receive_file().await.unwrap()
            }));
        }

        let group = GroupSend::new(peers, &test_config()).unwrap();
        let progress = group.progress();
        let outcome = group.run("shared.bin", data.clone()).await;

        assert_eq!(outcome.status, GroupStatus::Completed);
        assert_eq!(outcome.completed().count(), 3);
        assert_eq!(progress.fraction(), 1.0);
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap().data, data);
        }
    }

    #[tokio::test]
    async fn test_group_isolation_partial() {
        let data = test_payload(crate::MIN_CHUNK_SIZE * 2);
        let mut peers = Vec::new();
        let mut receivers = Vec::new();

        for name in ["alice", "carol"] {
            let (left, right) = memory_pair(64);
            peers.push((name.to_string(), left));
            let mut session = TransferSession::new(right, test_config().session);
            receivers.push(tokio::spawn(async move {
                session.receive_file().await.unwrap()
            }));
        }
        // Bob's peer goes away before the handshake completes
        let (bob_left, bob_right) = memory_pair(64);
        drop(bob_right);
        peers.insert(1, ("bob".to_string(), bob_left));

        let group = GroupSend::new(peers, &test_config()).unwrap();
        let outcome = group.run("shared.bin", data.clone()).await;

        assert_eq!(outcome.status, GroupStatus::Partial);
        let completed: Vec<&str> = outcome.completed().collect();
        assert!(completed.contains(&"alice"));
        assert!(completed.contains(&"carol"));
        let failed: Vec<&str> = outcome.failed().map(|(name, _)| name).collect();
        assert_eq!(failed, vec!["bob"]);
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap().data, data);
        }
    }

    #[tokio::test]
    async fn test_group_all_failed() {
        let (left, right) = memory_pair(4);
        drop(right);
        let group = GroupSend::new(vec![("alice".to_string(), left)], &test_config()).unwrap();
        let outcome = group.run("x.bin", test_payload(crate::MIN_CHUNK_SIZE)).await;
        assert_eq!(outcome.status, GroupStatus::Failed);
    }

    #[tokio::test]
    async fn test_bandwidth_split_across_recipients() {
        let config = GroupConfig {
            total_bandwidth_limit: Some(10 * 1024 * 1024),
            ..test_config()
        };
        let mut peers = Vec::new();
        let mut receivers = Vec::new();
        for name in ["a", "b"] {
            let (left, right) = memory_pair(64);
            peers.push((name.to_string(), left));
            let mut session = TransferSession::new(right, config.session.clone());
            receivers.push(tokio::spawn(async move {
                session.receive_file().await.unwrap()
            }));
        }
        let group = GroupSend::new(peers, &config).unwrap();
        let outcome = group.run("split.bin", test_payload(crate::MIN_CHUNK_SIZE)).await;
        assert_eq!(outcome.status, GroupStatus::Completed);
        for receiver in receivers {
            receiver.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_recipients_rejected_before_send() {
        let (left, _right) = memory_pair(4);
        let result = GroupSend::new(
            vec![("bad name!".to_string(), left)],
            &test_config(),
        );
        assert!(matches!(result, Err(Error::InvalidRecipient(_))));
    }
}
