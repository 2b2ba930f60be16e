//! User-facing notifications.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Fire-and-forget notification target.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, level: NotificationLevel);
}

/// Sends notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, message: &str, level: NotificationLevel) {
        match level {
            NotificationLevel::Info => tracing::info!(target: "notification", "{}", message),
            NotificationLevel::Warning => tracing::warn!(target: "notification", "{}", message),
            NotificationLevel::Error => tracing::error!(target: "notification", "{}", message),
        }
    }
}

/// Keeps every notification for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(NotificationLevel, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(NotificationLevel, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn count(&self, level: NotificationLevel) -> usize {
        self.messages()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, message: &str, level: NotificationLevel) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((level, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier_counts_levels() {
        let sink = RecordingNotifier::new();
        sink.notify("moved", NotificationLevel::Info);
        sink.notify("orphan", NotificationLevel::Warning);
        sink.notify("missing deck", NotificationLevel::Warning);

        assert_eq!(sink.count(NotificationLevel::Warning), 2);
        assert_eq!(sink.messages()[0], (NotificationLevel::Info, "moved".to_string()));
    }
}
