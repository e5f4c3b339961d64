use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const MAX_DEDUP_KEY_LENGTH: usize = 512;
pub const DEFAULT_COOLDOWN_SECONDS: i32 = 300;
pub const DEFAULT_DEDUP_KEY_TEMPLATE: &str = "{camera_id}:{rule_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Rank for descending-severity ordering; lower rank sorts first.
    pub fn rank(self) -> i32 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Delivered,
    Acknowledged,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "acknowledged" => Some(Self::Acknowledged),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    Offline,
    Error,
    Unknown,
}

impl CameraStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub folder_path: String,
    pub status: CameraStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub id: i64,
    pub camera_id: String,
    pub detected_at: DateTime<Utc>,
    pub object_type: Option<String>,
    pub confidence: Option<f32>,
    pub bbox: Option<BoundingBox>,
    pub enrichment: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub camera_id: String,
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub risk_score: Option<i32>,
    pub risk_level: Option<RiskLevel>,
    pub summary: Option<String>,
    pub reasoning: Option<String>,
    pub detection_ids: Option<String>,
}

impl Event {
    /// Parse the serialized detection-id list. Missing, empty, or malformed
    /// payloads resolve to an empty list so a bad event cannot stall the
    /// pipeline.
    pub fn parsed_detection_ids(&self) -> Vec<i64> {
        let Some(raw) = self.detection_ids.as_deref() else {
            return Vec::new();
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<JsonValue>(trimmed) {
            Ok(JsonValue::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_i64())
                .collect(),
            Ok(_) => {
                tracing::warn!(event_id = self.id, "detection_ids is not a JSON array; treating as empty");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(event_id = self.id, error = %err, "failed to parse detection_ids; treating as empty");
                Vec::new()
            }
        }
    }
}

/// Weekly schedule window attached to an alert rule. Data only; evaluation
/// lives in the rule engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Schedule {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub days: Option<Vec<String>>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub severity: AlertSeverity,
    pub risk_threshold: Option<i32>,
    pub camera_ids: Option<Vec<String>>,
    pub object_types: Option<Vec<String>>,
    pub zone_ids: Option<Vec<String>>,
    pub min_confidence: Option<f32>,
    pub schedule: Option<Schedule>,
    pub dedup_key_template: String,
    pub cooldown_seconds: i32,
    pub channels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: Uuid,
    pub event_id: i64,
    pub rule_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub dedup_key: String,
    pub channels: Vec<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

fn is_allowed_dedup_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':')
}

/// Validate and normalize a dedup key: trimmed, non-empty, at most
/// [`MAX_DEDUP_KEY_LENGTH`] chars, ASCII alphanumerics plus `_ - . :` only.
pub fn validate_dedup_key(raw: &str) -> Result<String, String> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err("dedup_key cannot be empty or whitespace-only".to_string());
    }
    if normalized.len() > MAX_DEDUP_KEY_LENGTH {
        return Err(format!(
            "dedup_key exceeds maximum length of {MAX_DEDUP_KEY_LENGTH} characters (got {})",
            normalized.len()
        ));
    }
    if let Some(bad) = normalized.chars().find(|ch| !is_allowed_dedup_char(*ch)) {
        return Err(format!(
            "dedup_key contains invalid character {bad:?}; only ASCII alphanumerics, underscores, hyphens, dots, and colons are allowed"
        ));
    }
    Ok(normalized.to_string())
}

/// Validate a camera storage folder path: no traversal segments, no shell or
/// filesystem metacharacters.
pub fn validate_folder_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("folder_path cannot be empty".to_string());
    }
    if trimmed.contains('\0') {
        return Err("folder_path contains a NUL byte".to_string());
    }
    const FORBIDDEN: &[char] = &['<', '>', '"', '|', '?', '*', ';', '$', '`'];
    if let Some(bad) = trimmed.chars().find(|ch| FORBIDDEN.contains(ch)) {
        return Err(format!("folder_path contains forbidden character {bad:?}"));
    }
    let has_traversal = trimmed
        .split(['/', '\\'])
        .any(|segment| segment == "..");
    if has_traversal {
        return Err("folder_path must not contain '..' traversal segments".to_string());
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_rank_orders_critical_first() {
        assert!(AlertSeverity::Critical.rank() < AlertSeverity::High.rank());
        assert!(AlertSeverity::High.rank() < AlertSeverity::Medium.rank());
        assert!(AlertSeverity::Medium.rank() < AlertSeverity::Low.rank());
    }

    #[test]
    fn severity_round_trips_through_strings() {
        for severity in [
            AlertSeverity::Low,
            AlertSeverity::Medium,
            AlertSeverity::High,
            AlertSeverity::Critical,
        ] {
            assert_eq!(AlertSeverity::parse(severity.as_str()), Some(severity));
        }
        assert_eq!(AlertSeverity::parse("CRITICAL"), Some(AlertSeverity::Critical));
        assert_eq!(AlertSeverity::parse("bogus"), None);
    }

    #[test]
    fn status_parse_accepts_known_values_only() {
        assert_eq!(AlertStatus::parse("pending"), Some(AlertStatus::Pending));
        assert_eq!(AlertStatus::parse(" DELIVERED "), Some(AlertStatus::Delivered));
        assert_eq!(AlertStatus::parse("open"), None);
    }

    #[test]
    fn validate_dedup_key_accepts_expected_charset() {
        assert_eq!(
            validate_dedup_key("front_door:person:entry-zone.1").unwrap(),
            "front_door:person:entry-zone.1"
        );
        assert_eq!(validate_dedup_key("  cam:rule  ").unwrap(), "cam:rule");
    }

    #[test]
    fn validate_dedup_key_rejects_bad_input() {
        assert!(validate_dedup_key("").is_err());
        assert!(validate_dedup_key("   ").is_err());
        assert!(validate_dedup_key("cam rule").is_err());
        assert!(validate_dedup_key("cam/rule").is_err());
        assert!(validate_dedup_key("caméra:rule").is_err());
        assert!(validate_dedup_key(&"x".repeat(MAX_DEDUP_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn validate_folder_path_rejects_traversal_and_metachars() {
        assert!(validate_folder_path("/export/cameras/front_door").is_ok());
        assert!(validate_folder_path("relative/path").is_ok());
        assert!(validate_folder_path("../etc/passwd").is_err());
        assert!(validate_folder_path("cameras/../../etc").is_err());
        assert!(validate_folder_path("cameras;rm -rf").is_err());
        assert!(validate_folder_path("").is_err());
    }

    #[test]
    fn parsed_detection_ids_tolerates_garbage() {
        let mut event = Event {
            id: 1,
            camera_id: "front_door".to_string(),
            batch_id: "batch-1".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            risk_score: Some(80),
            risk_level: Some(RiskLevel::High),
            summary: None,
            reasoning: None,
            detection_ids: Some("[1, 2, 3]".to_string()),
        };
        assert_eq!(event.parsed_detection_ids(), vec![1, 2, 3]);

        event.detection_ids = None;
        assert!(event.parsed_detection_ids().is_empty());

        event.detection_ids = Some("".to_string());
        assert!(event.parsed_detection_ids().is_empty());

        event.detection_ids = Some("{\"not\": \"a list\"}".to_string());
        assert!(event.parsed_detection_ids().is_empty());

        event.detection_ids = Some("not json".to_string());
        assert!(event.parsed_detection_ids().is_empty());
    }
}
