use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};

use crate::domain::{BoundingBox, Detection, Event, RiskLevel};

const EVENT_COLUMNS: &str = "id, camera_id, batch_id, started_at, ended_at, risk_score, \
     risk_level, summary, reasoning, detection_ids";

#[derive(Debug, Clone, FromRow)]
pub(crate) struct EventRow {
    id: i64,
    camera_id: String,
    batch_id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    risk_score: Option<i32>,
    risk_level: Option<String>,
    summary: Option<String>,
    reasoning: Option<String>,
    detection_ids: Option<String>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            camera_id: row.camera_id,
            batch_id: row.batch_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            risk_score: row.risk_score,
            risk_level: row.risk_level.as_deref().and_then(RiskLevel::parse),
            summary: row.summary,
            reasoning: row.reasoning,
            detection_ids: row.detection_ids,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct DetectionRow {
    id: i64,
    camera_id: String,
    detected_at: DateTime<Utc>,
    object_type: Option<String>,
    confidence: Option<f32>,
    bbox_x: Option<i32>,
    bbox_y: Option<i32>,
    bbox_width: Option<i32>,
    bbox_height: Option<i32>,
    enrichment: Option<SqlJson<JsonValue>>,
}

impl From<DetectionRow> for Detection {
    fn from(row: DetectionRow) -> Self {
        let bbox = match (row.bbox_x, row.bbox_y, row.bbox_width, row.bbox_height) {
            (Some(x), Some(y), Some(width), Some(height)) => Some(BoundingBox {
                x,
                y,
                width,
                height,
            }),
            _ => None,
        };
        Self {
            id: row.id,
            camera_id: row.camera_id,
            detected_at: row.detected_at,
            object_type: row.object_type,
            confidence: row.confidence,
            bbox,
            enrichment: row.enrichment.map(|value| value.0),
        }
    }
}

pub async fn get_event(pool: &PgPool, event_id: i64) -> Result<Option<Event>, sqlx::Error> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
    ))
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Event::from))
}

pub async fn get_events_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<Event>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id = ANY($1) ORDER BY started_at DESC, id DESC"
    ))
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Event::from).collect())
}

pub async fn list_recent_events(pool: &PgPool, limit: i64) -> Result<Vec<Event>, sqlx::Error> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events ORDER BY started_at DESC, id DESC LIMIT $1"
    ))
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Event::from).collect())
}

/// Load detections by id, tolerating ids that no longer resolve.
pub async fn get_detections_by_ids(
    pool: &PgPool,
    ids: &[i64],
) -> Result<Vec<Detection>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<DetectionRow> = sqlx::query_as(
        r#"
        SELECT id, camera_id, detected_at, object_type, confidence,
               bbox_x, bbox_y, bbox_width, bbox_height, enrichment
        FROM detections
        WHERE id = ANY($1)
        ORDER BY detected_at ASC, id ASC
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Detection::from).collect())
}

/// Detections for one event, resolved through its serialized id list.
pub async fn detections_for_event(
    pool: &PgPool,
    event: &Event,
) -> Result<Vec<Detection>, sqlx::Error> {
    get_detections_by_ids(pool, &event.parsed_detection_ids()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_bbox_requires_all_four_coordinates() {
        let mut row = DetectionRow {
            id: 1,
            camera_id: "front_door".to_string(),
            detected_at: Utc::now(),
            object_type: Some("person".to_string()),
            confidence: Some(0.9),
            bbox_x: Some(10),
            bbox_y: Some(20),
            bbox_width: Some(100),
            bbox_height: Some(200),
            enrichment: None,
        };
        let detection = Detection::from(row.clone());
        assert_eq!(
            detection.bbox,
            Some(BoundingBox {
                x: 10,
                y: 20,
                width: 100,
                height: 200
            })
        );

        row.bbox_width = None;
        let detection = Detection::from(row);
        assert!(detection.bbox.is_none());
    }

    #[test]
    fn event_row_conversion_ignores_unknown_risk_level() {
        let row = EventRow {
            id: 1,
            camera_id: "front_door".to_string(),
            batch_id: "batch".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            risk_score: Some(55),
            risk_level: Some("catastrophic".to_string()),
            summary: None,
            reasoning: None,
            detection_ids: None,
        };
        let event = Event::from(row);
        assert!(event.risk_level.is_none());
        assert_eq!(event.risk_score, Some(55));
    }
}
