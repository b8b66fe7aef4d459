use chrono::{SecondsFormat, Utc};

/// Ordered log of the decisions taken while handling one request.
///
/// Entries are formatted as `[<RFC 3339 timestamp>] <CODE>: <message>`. The
/// only mutation offered is [`Trail::record`]; entries are never reordered,
/// replaced or dropped while the trail is alive.
#[derive(Debug, Clone, Default)]
pub struct Trail {
    correlation_id: String,
    entries: Vec<String>,
}

impl Trail {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, code: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        tracing::info!(
            correlation_id = %self.correlation_id,
            code,
            "{message}"
        );
        self.entries.push(format!("[{ts}] {code}: {message}"));
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}
