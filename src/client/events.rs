//! Server-sent event framing for the configuration listener endpoint.

use super::datagrid::{ConfigEvent, ConfigEventKind};

/// Incremental parser for a `text/event-stream` body.
///
/// Bytes are fed as they arrive; complete events are returned once their
/// terminating blank line is seen. Events with unknown names are dropped.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ConfigEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }

    fn dispatch(&mut self) -> Option<ConfigEvent> {
        let name = self.event.take();
        let data = std::mem::take(&mut self.data);
        let kind = ConfigEventKind::from_event_name(name.as_deref()?)?;
        Some(ConfigEvent {
            kind,
            payload: data.join("\n"),
        })
    }
}
