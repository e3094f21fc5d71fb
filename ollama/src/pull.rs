use serde_json::Value as JsonValue;

/// Event emitted while a model pull is streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    /// Status line from the server ("pulling manifest", ...).
    Status(String),
    /// Byte-level progress for one layer.
    ChunkProgress {
        status: String,
        total: u64,
        completed: u64,
    },
    Success,
    Error(String),
}

impl PullEvent {
    /// Percentage for a progress event, when the totals allow one.
    pub fn percent(&self) -> Option<u8> {
        match self {
            PullEvent::ChunkProgress { total, completed, .. } if *total > 0 => {
                Some(((completed * 100) / total).min(100) as u8)
            }
            _ => None,
        }
    }
}

/// Maps one NDJSON object from `/api/pull` onto pull events.
pub(crate) fn pull_events_from_value(value: &JsonValue) -> Vec<PullEvent> {
    let mut events = Vec::new();
    let status = value.get("status").and_then(JsonValue::as_str);
    let total = value.get("total").and_then(JsonValue::as_u64);
    let completed = value.get("completed").and_then(JsonValue::as_u64);
    match (status, total) {
        (Some(status), Some(total)) => events.push(PullEvent::ChunkProgress {
            status: status.to_string(),
            total,
            completed: completed.unwrap_or(0),
        }),
        (Some(status), None) if status != "success" => {
            events.push(PullEvent::Status(status.to_string()));
        }
        _ => {}
    }
    events
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_status_and_progress_lines() {
        assert_eq!(
            pull_events_from_value(&json!({"status": "pulling manifest"})),
            vec![PullEvent::Status("pulling manifest".to_string())]
        );
        let events = pull_events_from_value(
            &json!({"status": "downloading", "total": 200, "completed": 50}),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent(), Some(25));
    }

    #[test]
    fn success_line_is_not_a_status_event() {
        assert!(pull_events_from_value(&json!({"status": "success"})).is_empty());
    }
}
