use serde_json::Value;
use ticket_sync::{ConnectionState, Record, ViewProjector};
use tracing::info;

const TITLE_FIELDS: [&str; 3] = ["title", "subject", "name"];

pub fn status_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "offline",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Open => "live",
        ConnectionState::Backoff => "reconnecting",
    }
}

/// `id  [status]  title` for one row of the list.
pub fn row(record: &Record) -> String {
    let title = TITLE_FIELDS
        .iter()
        .find_map(|key| record.field(key).and_then(Value::as_str))
        .unwrap_or("");
    match record.field("status") {
        Some(status) if !status.is_null() => format!("{}  [{}]  {}", record.id, status, title),
        _ => format!("{}  {}", record.id, title),
    }
}

pub fn log_view(projector: &ViewProjector, selected: Option<&str>) {
    let records = projector.records();
    let status = projector.connection_status();
    info!(
        status = status_label(status),
        records = records.len(),
        "view updated"
    );
    for record in &records {
        info!("  {}", row(record));
    }
    if let Some(id) = selected {
        match projector.selected(id) {
            Some(record) => {
                let detail = serde_json::to_string_pretty(&record).unwrap_or_default();
                info!(id, "selected:\n{detail}");
            }
            None => info!(id, "selected ticket not loaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_prefers_title_and_shows_status() {
        let record = Record::new("t-1")
            .with_field("name", "fallback")
            .with_field("title", "Printer on fire")
            .with_field("status", 2);
        assert_eq!(row(&record), "t-1  [2]  Printer on fire");
    }

    #[test]
    fn row_without_status_or_title() {
        let record = Record::new("t-2").with_field("status", Value::Null);
        assert_eq!(row(&record), "t-2  ");
    }

    #[test]
    fn labels_cover_every_state() {
        assert_eq!(status_label(ConnectionState::Open), "live");
        assert_eq!(status_label(ConnectionState::Backoff), "reconnecting");
    }
}
