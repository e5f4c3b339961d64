use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::domain::{
    validate_dedup_key, AlertRule, AlertSeverity, Schedule, DEFAULT_DEDUP_KEY_TEMPLATE,
};

/// A rule that matched an event, with the dedup key derived for it.
#[derive(Debug, Clone)]
pub struct TriggeredRule {
    pub rule: AlertRule,
    pub severity: AlertSeverity,
    pub matched_conditions: Vec<String>,
    pub dedup_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    pub triggered: Vec<TriggeredRule>,
    pub skipped: Vec<(AlertRule, String)>,
}

/// Per-event outcome of a dry-run rule test; never touches the dedup gate.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct RuleTestOutcome {
    pub event_id: i64,
    pub matched: bool,
    pub matched_conditions: Vec<String>,
}

/// Inputs for dedup-key template expansion.
#[derive(Debug, Clone, Copy)]
pub struct DedupKeyContext<'a> {
    pub camera_id: &'a str,
    pub rule_id: &'a str,
    pub object_type: &'a str,
    pub risk_level: &'a str,
}

impl<'a> DedupKeyContext<'a> {
    fn lookup(&self, placeholder: &str) -> Option<&'a str> {
        match placeholder {
            "camera_id" => Some(self.camera_id),
            "rule_id" => Some(self.rule_id),
            "object_type" => Some(self.object_type),
            "risk_level" => Some(self.risk_level),
            _ => None,
        }
    }
}

fn expand_template(template: &str, ctx: &DedupKeyContext<'_>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices();
    while let Some((start, ch)) = chars.next() {
        if ch != '{' {
            out.push(ch);
            continue;
        }
        let Some(end) = template[start..].find('}').map(|offset| start + offset) else {
            return Err(format!("unbalanced brace in template {template:?}"));
        };
        let placeholder = &template[start + 1..end];
        let Some(value) = ctx.lookup(placeholder) else {
            return Err(format!("unknown placeholder {placeholder:?}"));
        };
        out.push_str(value);
        // Skip to the closing brace.
        while let Some((idx, _)) = chars.next() {
            if idx == end {
                break;
            }
        }
    }
    Ok(out)
}

/// Expand a rule's dedup-key template. Unknown placeholders and unbalanced
/// braces fall back to the default `{camera_id}:{rule_id}` template with a
/// warning; the expanded key must pass dedup-key validation.
pub fn build_dedup_key(rule: &AlertRule, ctx: &DedupKeyContext<'_>) -> Result<String, String> {
    let expanded = match expand_template(&rule.dedup_key_template, ctx) {
        Ok(expanded) => expanded,
        Err(reason) => {
            tracing::warn!(
                rule = %rule.name,
                template = %rule.dedup_key_template,
                reason = %reason,
                "falling back to default dedup key template"
            );
            expand_template(DEFAULT_DEDUP_KEY_TEMPLATE, ctx)?
        }
    };
    validate_dedup_key(&expanded)
}

fn parse_hh_mm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

fn weekday_name(now_local: &DateTime<Tz>) -> &'static str {
    match now_local.weekday() {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}

/// Whether `now` falls inside the schedule window. Unknown timezones fall
/// back to UTC; unparseable times fail open. Both paths warn.
pub fn schedule_matches(rule_name: &str, schedule: &Schedule, now: DateTime<Utc>) -> bool {
    let tz: Tz = match schedule.timezone.as_deref() {
        None => chrono_tz::UTC,
        Some(raw) => match raw.parse() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(rule = %rule_name, timezone = %raw, "unknown schedule timezone; falling back to UTC");
                chrono_tz::UTC
            }
        },
    };
    let now_local = now.with_timezone(&tz);

    if let Some(days) = schedule.days.as_ref().filter(|days| !days.is_empty()) {
        let today = weekday_name(&now_local);
        let on_listed_day = days
            .iter()
            .any(|day| day.trim().eq_ignore_ascii_case(today));
        if !on_listed_day {
            return false;
        }
    }

    let (Some(start_raw), Some(end_raw)) = (
        schedule.start_time.as_deref(),
        schedule.end_time.as_deref(),
    ) else {
        return true;
    };
    let (Some(start), Some(end)) = (parse_hh_mm(start_raw), parse_hh_mm(end_raw)) else {
        tracing::warn!(
            rule = %rule_name,
            start_time = %start_raw,
            end_time = %end_raw,
            "unparseable schedule time; treating schedule as matching"
        );
        return true;
    };

    let current = NaiveTime::from_hms_opt(now_local.hour(), now_local.minute(), 0)
        .unwrap_or(start);
    if start <= end {
        current >= start && current <= end
    } else {
        // Window wraps past midnight, e.g. 22:00-06:00.
        current >= start || current <= end
    }
}
