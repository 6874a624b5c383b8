// Result sink: best-effort publication of decisions to the shared key-value store

use crate::error::{EmotionRelayError, Result};
use crate::models::Decision;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Root under which each device's emotion is stored
pub const EMOTION_ROOT: &str = "emotion";

/// Which of the two fixed slots this device writes and which it reads.
///
/// Paired devices use opposite toggles so each one reads what the other writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSlots {
    pub listen: &'static str,
    pub write: &'static str,
}

impl DeviceSlots {
    pub fn for_toggle(paired: bool) -> Self {
        if paired {
            Self {
                listen: "1",
                write: "2",
            }
        } else {
            Self {
                listen: "2",
                write: "1",
            }
        }
    }

    /// Key this device publishes its own emotion under
    pub fn write_key(&self) -> String {
        format!("{EMOTION_ROOT}/{}", self.write)
    }

    /// Key the partner device publishes under
    pub fn listen_key(&self) -> String {
        format!("{EMOTION_ROOT}/{}", self.listen)
    }
}

/// Write side of the remote key-value store
pub trait ResultSink {
    fn publish(&self, key: &str, value: &str) -> Result<()>;
}

impl<T: ResultSink + ?Sized> ResultSink for Arc<T> {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        (**self).publish(key, value)
    }
}

impl<T: ResultSink + ?Sized> ResultSink for Box<T> {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        (**self).publish(key, value)
    }
}

/// Sink that only logs, used when no database is configured
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        info!(key, value, "Emotion result");
        Ok(())
    }
}

/// Remote store settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Realtime database root, e.g. `https://example-default-rtdb.firebaseio.com`
    pub database_url: Option<String>,
    /// Database secret or ID token, sent as the `auth` query parameter
    pub auth_token: Option<String>,
    /// Paired/unpaired toggle selecting the device slots
    pub paired: bool,
    /// Pending writes kept while the writer thread is busy
    pub queue_depth: usize,
    /// Per-request timeout, in milliseconds
    pub timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            auth_token: None,
            paired: true,
            queue_depth: 8,
            timeout_ms: 5000,
        }
    }
}

/// Realtime-database REST client: values live at `{database_url}/{key}.json`
pub struct RealtimeDbSink {
    agent: ureq::Agent,
    database_url: String,
    auth_token: Option<String>,
}

impl RealtimeDbSink {
    pub fn new(database_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            database_url: database_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn from_config(config: &SinkConfig) -> Option<Self> {
        let url = config.database_url.as_deref()?;
        Some(Self::new(
            url,
            config.auth_token.clone(),
            Duration::from_millis(config.timeout_ms),
        ))
    }

    pub fn endpoint(&self, key: &str) -> String {
        format!("{}/{}.json", self.database_url, key.trim_matches('/'))
    }

    /// Reads the string stored at `key`; `None` when the key is unset
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let mut request = self.agent.get(&self.endpoint(key));
        if let Some(token) = &self.auth_token {
            request = request.query("auth", token);
        }
        let mut response = request.call()?;
        let value: serde_json::Value = response.body_mut().read_json()?;
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(text) => Ok(Some(text)),
            other => Err(EmotionRelayError::Sink(format!(
                "expected a string at {key}, found {other}"
            ))),
        }
    }
}

impl ResultSink for RealtimeDbSink {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        let mut request = self.agent.put(&self.endpoint(key));
        if let Some(token) = &self.auth_token {
            request = request.query("auth", token);
        }
        request.send_json(value)?;
        debug!(key, value, "Published emotion");
        Ok(())
    }
}

struct Write {
    key: String,
    value: String,
}

/// Fire-and-forget front of a sink.
///
/// Writes run on a dedicated thread; [`SinkDispatcher::submit`] never blocks,
/// and a write that cannot be queued is dropped with a warning. Failed writes
/// are logged and never retried.
pub struct SinkDispatcher {
    sender: Option<mpsc::Sender<Write>>,
    writer: Option<JoinHandle<()>>,
}

impl SinkDispatcher {
    pub fn spawn(sink: impl ResultSink + Send + 'static, queue_depth: usize) -> Result<Self> {
        if queue_depth == 0 {
            return Err(EmotionRelayError::Config(
                "sink queue depth must be at least 1".to_string(),
            ));
        }
        let (sender, mut receiver) = mpsc::channel::<Write>(queue_depth);
        let writer = std::thread::Builder::new()
            .name("emotion-sink".to_string())
            .spawn(move || {
                while let Some(write) = receiver.blocking_recv() {
                    if let Err(e) = sink.publish(&write.key, &write.value) {
                        warn!("Failed to publish {} to {}: {}", write.value, write.key, e);
                    }
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            writer: Some(writer),
        })
    }

    pub fn submit(&self, key: String, value: String) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(Write { key, value }) {
            match e {
                mpsc::error::TrySendError::Full(write) => {
                    warn!("Sink busy, dropping write of {} to {}", write.value, write.key)
                }
                mpsc::error::TrySendError::Closed(write) => {
                    warn!("Sink closed, dropping write of {} to {}", write.value, write.key)
                }
            }
        }
    }

    /// Publishes a frame decision under this device's slot
    pub fn submit_decision(&self, slots: &DeviceSlots, decision: &Decision) {
        self.submit(slots.write_key(), decision.display_value());
    }
}

impl Drop for SinkDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("Sink writer thread panicked");
            }
        }
    }
}
