use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSeverity {
    Info,
    Success,
    Warning,
    Error,
}

stored_object!(IngestionEvent, "ingestion_event", {
    source_document_id: String,
    message: String,
    severity: EventSeverity,
    phase: String,
    phase_metadata: serde_json::Value
});

impl IngestionEvent {
    pub fn new(
        source_document_id: impl Into<String>,
        message: impl Into<String>,
        severity: EventSeverity,
        phase: impl Into<String>,
        phase_metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_document_id: source_document_id.into(),
            message: message.into(),
            severity,
            phase: phase.into(),
            phase_metadata,
        }
    }

    pub async fn append(
        db: &SurrealDbClient,
        source_document_id: &str,
        message: &str,
        severity: EventSeverity,
        phase: &str,
        phase_metadata: serde_json::Value,
    ) -> Result<Self, AppError> {
        let event = Self::new(source_document_id, message, severity, phase, phase_metadata);
        let stored = db.store_item(event.clone()).await?;
        Ok(stored.unwrap_or(event))
    }

    /// Pagination cursor: `"{created_at}|{event_id}"`.
    pub fn cursor(&self) -> String {
        format!("{}|{}", self.created_at.to_rfc3339(), self.id)
    }

    /// Events for a document after the given cursor, oldest first.
    pub async fn list_after(
        db: &SurrealDbClient,
        source_document_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Self>, AppError> {
        let events: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE source_document_id = $doc \
                 ORDER BY created_at ASC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("doc", source_document_id.to_owned()))
            // Over-fetch so cursor filtering still fills the page.
            .bind(("limit", (limit * 4).max(limit) as i64))
            .await?
            .take(0)?;

        let Some(cursor) = cursor else {
            return Ok(events.into_iter().take(limit).collect());
        };

        let (cursor_time, cursor_id) = parse_cursor(cursor)?;
        Ok(events
            .into_iter()
            .filter(|event| {
                event.created_at > cursor_time
                    || (event.created_at == cursor_time && event.id > cursor_id)
            })
            .take(limit)
            .collect())
    }

    /// Timestamp of the newest event for a document, if any.
    pub async fn latest_event_time(
        db: &SurrealDbClient,
        source_document_id: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let events: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE source_document_id = $doc \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("doc", source_document_id.to_owned()))
            .await?
            .take(0)?;
        Ok(events.into_iter().next().map(|event| event.created_at))
    }
}

fn parse_cursor(cursor: &str) -> Result<(DateTime<Utc>, String), AppError> {
    let (time_part, id_part) = cursor
        .split_once('|')
        .ok_or_else(|| AppError::Validation(format!("invalid event cursor: {cursor}")))?;
    let time = DateTime::parse_from_rfc3339(time_part)
        .map_err(|err| AppError::Validation(format!("invalid event cursor timestamp: {err}")))?
        .with_timezone(&Utc);
    Ok((time, id_part.to_owned()))
}
