use super::stream::{StreamEntry, StreamReader};
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type ExternalMessageHandler = Arc<dyn Fn(StreamEntry) + Send + Sync>;

/// Polls a session's stream for user messages injected by other processes
/// and hands each unseen one to the handler exactly once per watcher run.
/// Entries already in the stream at start are unseen too: a backlog that
/// accumulated while the process was down is replayed, in stream order.
///
/// Read failures are transient by assumption (the stream may not exist yet)
/// and never stop the loop.
pub struct StreamWatcher {
    handle: Option<JoinHandle<()>>,
}

impl StreamWatcher {
    pub fn start(
        reader: Arc<dyn StreamReader>,
        session_id: String,
        poll_interval: Duration,
        handler: ExternalMessageHandler,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let entries = match reader.read_entries(&session_id).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        debug!("Stream poll for {session_id} failed: {err}");
                        continue;
                    }
                };

                for entry in entries {
                    if !is_external_user_message(&entry) {
                        continue;
                    }
                    if !seen.insert(entry.headers.message_id.clone()) {
                        continue;
                    }
                    handler(entry);
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for StreamWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_external_user_message(entry: &StreamEntry) -> bool {
    entry.headers.role == "user" && entry.headers.origin.as_deref() == Some("external")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::stream::StreamHeaders;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedReader {
        entries: Mutex<Vec<StreamEntry>>,
        fail: Mutex<bool>,
    }

    impl ScriptedReader {
        fn new() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            }
        }

        fn push(&self, entry: StreamEntry) {
            self.entries.lock().unwrap().push(entry);
        }

        fn set_failing(&self, failing: bool) {
            *self.fail.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl StreamReader for ScriptedReader {
        async fn read_entries(&self, _session_id: &str) -> Result<Vec<StreamEntry>> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("stream offline");
            }
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    fn external_message(message_id: &str, text: &str) -> StreamEntry {
        StreamEntry {
            key: format!("{message_id}:0"),
            value: json!({ "text": text }),
            headers: StreamHeaders {
                role: "user".to_string(),
                message_id: message_id.to_string(),
                origin: Some("external".to_string()),
            },
        }
    }

    fn assistant_message(message_id: &str) -> StreamEntry {
        StreamEntry {
            key: format!("{message_id}:0"),
            value: json!({ "text": "reply" }),
            headers: StreamHeaders {
                role: "assistant".to_string(),
                message_id: message_id.to_string(),
                origin: None,
            },
        }
    }

    #[tokio::test]
    async fn delivers_new_external_messages_once() {
        let reader = Arc::new(ScriptedReader::new());
        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));

        let handler: ExternalMessageHandler = {
            let delivered = delivered.clone();
            Arc::new(move |entry| {
                delivered
                    .lock()
                    .unwrap()
                    .push(entry.headers.message_id.clone());
            })
        };

        let mut watcher = StreamWatcher::start(
            reader.clone(),
            "s1".to_string(),
            Duration::from_millis(10),
            handler,
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        reader.push(external_message("m1", "do the thing"));
        reader.push(assistant_message("m2"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Re-reads of the same file must not redeliver.
        tokio::time::sleep(Duration::from_millis(40)).await;
        watcher.stop();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.as_slice(), ["m1"]);
    }

    #[tokio::test]
    async fn backlog_present_at_start_is_delivered_in_order() {
        let reader = Arc::new(ScriptedReader::new());
        // Submitted while no watcher was running; must not be lost.
        reader.push(external_message("old", "while you were away"));
        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));

        let handler: ExternalMessageHandler = {
            let delivered = delivered.clone();
            Arc::new(move |entry| {
                delivered
                    .lock()
                    .unwrap()
                    .push(entry.headers.message_id.clone());
            })
        };

        let mut watcher = StreamWatcher::start(
            reader.clone(),
            "s1".to_string(),
            Duration::from_millis(10),
            handler,
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        reader.push(external_message("new", "fresh"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        watcher.stop();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.as_slice(), ["old", "new"]);
    }

    #[tokio::test]
    async fn read_failures_do_not_stop_the_loop() {
        let reader = Arc::new(ScriptedReader::new());
        reader.set_failing(true);
        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));

        let handler: ExternalMessageHandler = {
            let delivered = delivered.clone();
            Arc::new(move |entry| {
                delivered
                    .lock()
                    .unwrap()
                    .push(entry.headers.message_id.clone());
            })
        };

        let mut watcher = StreamWatcher::start(
            reader.clone(),
            "s1".to_string(),
            Duration::from_millis(10),
            handler,
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        reader.set_failing(false);
        reader.push(external_message("m1", "after recovery"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        watcher.stop();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.as_slice(), ["m1"]);
    }
}
