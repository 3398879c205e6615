//! File-based per-agent JSONL inbox, the messaging substrate between the
//! lead orchestrator and its task agents.

use crate::constants::MAILBOX_POLL_INTERVAL_MS;
use crate::fs_lock;
use crate::models::{Message, MessageType};
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct MessageBus {
    mailbox_dir: PathBuf,
    write_lock_timeout: Duration,
    read_lock_timeout: Duration,
    /// Per-agent read cursor (byte offset into that agent's own inbox file).
    cursors: Arc<Mutex<HashMap<String, u64>>>,
}

impl MessageBus {
    pub fn new(mailbox_dir: PathBuf, write_lock_timeout: Duration, read_lock_timeout: Duration) -> Self {
        Self {
            mailbox_dir,
            write_lock_timeout,
            read_lock_timeout,
            cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn inbox_path(&self, agent_id: &str) -> PathBuf {
        self.mailbox_dir.join(format!("{agent_id}.jsonl"))
    }

    fn lock_path(&self, agent_id: &str) -> PathBuf {
        self.mailbox_dir.join(format!("{agent_id}.lock"))
    }

    /// Appends one JSON line to `to`'s inbox under `to`'s lock. Fails if
    /// the lock cannot be acquired within the write-lock timeout.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        content: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let mut message = Message::new(from, to, message_type, content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }

        let line = serde_json::to_string(&message)?;
        debug_assert!(!line.contains('\n'));

        let lock_path = self.lock_path(to);
        let _guard = fs_lock::acquire(&lock_path, self.write_lock_timeout).await?;

        let inbox_path = self.inbox_path(to);
        if let Some(parent) = inbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inbox_path)
            .await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Sends to every known agent except `from`. Per-recipient failures
    /// are swallowed (spec.md 4.3) — broadcast is best-effort.
    pub async fn broadcast(&self, from: &str, content: &str, known_ids: &[String]) {
        for id in known_ids {
            if id == from {
                continue;
            }
            if let Err(e) = self
                .send(from, id, MessageType::Broadcast, content, None)
                .await
            {
                warn!(recipient = %id, "broadcast delivery failed: {}", e);
            }
        }
    }

    /// Reads new lines appended since this agent's cursor, advances the
    /// cursor to end-of-file, and returns the parsed messages. Corrupt
    /// lines are skipped. Returns an empty vec (not an error) if the
    /// agent's own lock cannot be acquired — callers retry next poll.
    pub async fn poll(&self, agent_id: &str) -> Result<Vec<Message>> {
        let lock_path = self.lock_path(agent_id);
        let guard = fs_lock::try_acquire(&lock_path, self.read_lock_timeout).await?;
        let Some(_guard) = guard else {
            return Ok(Vec::new());
        };

        let inbox_path = self.inbox_path(agent_id);
        if !inbox_path.exists() {
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read(&inbox_path).await?;
        let mut cursors = self.cursors.lock().await;
        let cursor = *cursors.get(agent_id).unwrap_or(&0);
        let start = cursor.min(raw.len() as u64) as usize;
        let slice = &raw[start..];

        let mut messages = Vec::new();
        for line in slice.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => debug!("skipping corrupt mailbox line for {}: {}", agent_id, e),
            }
        }

        cursors.insert(agent_id.to_string(), raw.len() as u64);
        Ok(messages)
    }

    /// Polls every 200ms until a message arrives or `timeout` elapses.
    pub async fn wait_for_messages(&self, agent_id: &str, timeout: Duration) -> Result<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.poll(agent_id).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(MAILBOX_POLL_INTERVAL_MS)).await;
        }
    }

    /// Same as `wait_for_messages` but returns the first message matching
    /// `message_type`, discarding the rest back onto... nothing: per
    /// spec.md 4.3 polling advances the cursor unconditionally, so
    /// non-matching messages observed during the wait are consumed.
    pub async fn wait_for_message(
        &self,
        agent_id: &str,
        message_type: MessageType,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.poll(agent_id).await?;
            if let Some(found) = messages.into_iter().find(|m| m.message_type == message_type) {
                return Ok(Some(found));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(MAILBOX_POLL_INTERVAL_MS)).await;
        }
    }

    pub async fn unread_count(&self, agent_id: &str) -> Result<usize> {
        let inbox_path = self.inbox_path(agent_id);
        if !inbox_path.exists() {
            return Ok(0);
        }
        let raw = tokio::fs::read(&inbox_path).await?;
        let cursor = *self.cursors.lock().await.get(agent_id).unwrap_or(&0);
        let start = cursor.min(raw.len() as u64) as usize;
        let count = raw[start..].split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
        Ok(count)
    }

    /// Every agent id with a known mailbox file, regardless of lifecycle
    /// state (SPEC_FULL.md 4.3's resolution of Open Question 4).
    pub async fn known_agent_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.mailbox_dir.exists() {
            return Ok(ids);
        }
        let mut entries = tokio::fs::read_dir(&self.mailbox_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".jsonl") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub async fn clear_inbox(&self, agent_id: &str) -> Result<()> {
        let inbox_path = self.inbox_path(agent_id);
        if inbox_path.exists() {
            tokio::fs::remove_file(&inbox_path).await?;
        }
        self.cursors.lock().await.remove(agent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(dir: &std::path::Path) -> MessageBus {
        MessageBus::new(
            dir.to_path_buf(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn send_then_poll_returns_message() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());

        bus.send("lead", "agent-1", MessageType::Text, "hello", None)
            .await
            .unwrap();

        let messages = bus.poll("agent-1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn poll_only_returns_new_messages_since_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());

        bus.send("lead", "agent-1", MessageType::Text, "first", None)
            .await
            .unwrap();
        bus.poll("agent-1").await.unwrap();

        bus.send("lead", "agent-1", MessageType::Text, "second", None)
            .await
            .unwrap();
        let messages = bus.poll("agent-1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "second");
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let ids = vec!["lead".to_string(), "agent-1".to_string(), "agent-2".to_string()];

        bus.broadcast("lead", "status", &ids).await;

        assert_eq!(bus.poll("agent-1").await.unwrap().len(), 1);
        assert_eq!(bus.poll("agent-2").await.unwrap().len(), 1);
        assert_eq!(bus.poll("lead").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn wait_for_message_filters_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());

        bus.send("agent-1", "lead", MessageType::StatusUpdate, "busy", None)
            .await
            .unwrap();
        bus.send("agent-1", "lead", MessageType::PlanSubmission, "my plan", None)
            .await
            .unwrap();

        let found = bus
            .wait_for_message("lead", MessageType::PlanSubmission, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(found.unwrap().content, "my plan");
    }

    #[tokio::test]
    async fn known_agent_ids_lists_mailbox_files() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.send("lead", "agent-1", MessageType::Text, "hi", None)
            .await
            .unwrap();

        let ids = bus.known_agent_ids().await.unwrap();
        assert_eq!(ids, vec!["agent-1".to_string()]);
    }

    #[tokio::test]
    async fn clear_inbox_removes_file_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.send("lead", "agent-1", MessageType::Text, "hi", None)
            .await
            .unwrap();
        bus.poll("agent-1").await.unwrap();

        bus.clear_inbox("agent-1").await.unwrap();
        assert_eq!(bus.unread_count("agent-1").await.unwrap(), 0);
    }
}
