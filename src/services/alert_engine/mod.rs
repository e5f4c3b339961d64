use chrono::{DateTime, Utc};

pub mod types;

pub use types::{
    build_dedup_key, schedule_matches, DedupKeyContext, EvaluationResult, RuleTestOutcome,
    TriggeredRule,
};

use crate::domain::{AlertRule, Detection, Event};

/// Evaluate a rule set against one event. Pure: all inputs are passed in,
/// including the clock reading. Triggered rules come back sorted by severity
/// descending, ties broken by rule name ascending; per-rule failures are
/// reported in `skipped` and never abort the batch.
pub fn evaluate(
    rules: &[AlertRule],
    event: &Event,
    detections: &[Detection],
    now: DateTime<Utc>,
) -> EvaluationResult {
    let mut result = EvaluationResult::default();

    for rule in rules {
        if !rule.enabled {
            continue;
        }
        match evaluate_rule(rule, event, detections, now) {
            Ok(Some(matched_conditions)) => {
                let dedup_key = match derive_dedup_key(rule, event, detections) {
                    Ok(dedup_key) => dedup_key,
                    Err(reason) => {
                        tracing::warn!(rule = %rule.name, reason = %reason, "rule evaluation failed");
                        result
                            .skipped
                            .push((rule.clone(), format!("evaluation_error:{reason}")));
                        continue;
                    }
                };
                result.triggered.push(TriggeredRule {
                    rule: rule.clone(),
                    severity: rule.severity,
                    matched_conditions,
                    dedup_key,
                });
            }
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!(rule = %rule.name, reason = %reason, "rule evaluation failed");
                result
                    .skipped
                    .push((rule.clone(), format!("evaluation_error:{reason}")));
            }
        }
    }

    result.triggered.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| a.rule.name.cmp(&b.rule.name))
    });
    result
}

/// Dry-run a single rule against a batch of historical events. Reports, per
/// event, whether the rule would have matched and which conditions matched.
pub fn test_rule_against_events(
    rule: &AlertRule,
    events: &[(Event, Vec<Detection>)],
    now: DateTime<Utc>,
) -> Vec<RuleTestOutcome> {
    events
        .iter()
        .map(|(event, detections)| match evaluate_rule(rule, event, detections, now) {
            Ok(Some(matched_conditions)) => RuleTestOutcome {
                event_id: event.id,
                matched: true,
                matched_conditions,
            },
            Ok(None) | Err(_) => RuleTestOutcome {
                event_id: event.id,
                matched: false,
                matched_conditions: Vec::new(),
            },
        })
        .collect()
}

/// AND semantics over the rule's configured conditions; a rule with no
/// conditions matches unconditionally. `Ok(Some(matched))` means the rule
/// fires, `Ok(None)` means at least one condition failed.
fn evaluate_rule(
    rule: &AlertRule,
    event: &Event,
    detections: &[Detection],
    now: DateTime<Utc>,
) -> Result<Option<Vec<String>>, String> {
    let mut matched = Vec::new();

    if let Some(threshold) = rule.risk_threshold {
        // A null risk score never satisfies the threshold, even at 0.
        match event.risk_score {
            Some(score) if score >= threshold => {
                matched.push(format!("risk_score >= {threshold}"));
            }
            _ => return Ok(None),
        }
    }

    if let Some(camera_ids) = rule.camera_ids.as_ref().filter(|ids| !ids.is_empty()) {
        if !camera_ids.iter().any(|id| id == &event.camera_id) {
            return Ok(None);
        }
        matched.push(format!("camera_id in {camera_ids:?}"));
    }

    if let Some(object_types) = rule.object_types.as_ref().filter(|types| !types.is_empty()) {
        let any_match = detections.iter().any(|detection| {
            detection.object_type.as_deref().is_some_and(|object_type| {
                object_types
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(object_type))
            })
        });
        if !any_match {
            return Ok(None);
        }
        matched.push(format!("object_type in {object_types:?}"));
    }

    if let Some(threshold) = rule.min_confidence {
        let any_match = detections
            .iter()
            .any(|detection| detection.confidence.is_some_and(|c| c >= threshold));
        if !any_match {
            return Ok(None);
        }
        matched.push(format!("confidence >= {threshold}"));
    }

    if let Some(zone_ids) = rule.zone_ids.as_ref().filter(|ids| !ids.is_empty()) {
        // Zone membership is not part of the detection model yet; the
        // condition is diagnostic-only and never blocks firing.
        tracing::debug!(rule = %rule.name, zone_ids = ?zone_ids, "zone_ids condition present but not evaluated");
    }

    if let Some(schedule) = rule.schedule.as_ref() {
        if !schedule_matches(&rule.name, schedule, now) {
            return Ok(None);
        }
        matched.push("within_schedule".to_string());
    }

    Ok(Some(matched))
}

fn derive_dedup_key(
    rule: &AlertRule,
    event: &Event,
    detections: &[Detection],
) -> Result<String, String> {
    let object_type = detections
        .first()
        .and_then(|detection| detection.object_type.as_deref())
        .unwrap_or("unknown");
    let risk_level = event
        .risk_level
        .map(|level| level.as_str())
        .unwrap_or("unknown");
    let rule_id = rule.id.to_string();
    build_dedup_key(
        rule,
        &DedupKeyContext {
            camera_id: &event.camera_id,
            rule_id: &rule_id,
            object_type,
            risk_level,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertSeverity, RiskLevel, Schedule};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn rule(name: &str, severity: AlertSeverity) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            enabled: true,
            severity,
            risk_threshold: None,
            camera_ids: None,
            object_types: None,
            zone_ids: None,
            min_confidence: None,
            schedule: None,
            dedup_key_template: "{camera_id}:{rule_id}".to_string(),
            cooldown_seconds: 300,
            channels: vec!["email".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(risk_score: Option<i32>) -> Event {
        Event {
            id: 42,
            camera_id: "front_door".to_string(),
            batch_id: "batch-1".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            risk_score,
            risk_level: Some(RiskLevel::High),
            summary: None,
            reasoning: None,
            detection_ids: Some("[1,2]".to_string()),
        }
    }

    fn detection(object_type: &str, confidence: f32) -> Detection {
        Detection {
            id: 1,
            camera_id: "front_door".to_string(),
            detected_at: Utc::now(),
            object_type: Some(object_type.to_string()),
            confidence: Some(confidence),
            bbox: None,
            enrichment: None,
        }
    }

    #[test]
    fn rule_without_conditions_fires_unconditionally() {
        let result = evaluate(&[rule("open", AlertSeverity::Low)], &event(None), &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);
        assert!(result.triggered[0].matched_conditions.is_empty());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn disabled_rules_are_not_evaluated() {
        let mut disabled = rule("disabled", AlertSeverity::High);
        disabled.enabled = false;
        let result = evaluate(&[disabled], &event(Some(99)), &[], Utc::now());
        assert!(result.triggered.is_empty());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn risk_threshold_requires_present_score() {
        let mut guarded = rule("risk", AlertSeverity::High);
        guarded.risk_threshold = Some(70);

        let result = evaluate(&[guarded.clone()], &event(Some(80)), &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);
        assert_eq!(
            result.triggered[0].matched_conditions,
            vec!["risk_score >= 70".to_string()]
        );

        let result = evaluate(&[guarded.clone()], &event(Some(60)), &[], Utc::now());
        assert!(result.triggered.is_empty());

        // Null risk score never satisfies the threshold, even at zero.
        guarded.risk_threshold = Some(0);
        let result = evaluate(&[guarded], &event(None), &[], Utc::now());
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn object_types_match_case_insensitively() {
        let mut person_rule = rule("person", AlertSeverity::Medium);
        person_rule.object_types = Some(vec!["PERSON".to_string()]);

        let detections = vec![detection("person", 0.8)];
        let result = evaluate(&[person_rule.clone()], &event(None), &detections, Utc::now());
        assert_eq!(result.triggered.len(), 1);

        let vehicles = vec![detection("vehicle", 0.8)];
        let result = evaluate(&[person_rule.clone()], &event(None), &vehicles, Utc::now());
        assert!(result.triggered.is_empty());

        // Empty detections never satisfy object_types.
        let result = evaluate(&[person_rule], &event(None), &[], Utc::now());
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn min_confidence_requires_a_confident_detection() {
        let mut confident = rule("confident", AlertSeverity::Medium);
        confident.min_confidence = Some(0.9);

        let detections = vec![detection("person", 0.95), detection("vehicle", 0.5)];
        let result = evaluate(&[confident.clone()], &event(None), &detections, Utc::now());
        assert_eq!(result.triggered.len(), 1);
        assert_eq!(
            result.triggered[0].matched_conditions,
            vec!["confidence >= 0.9".to_string()]
        );

        let weak = vec![detection("person", 0.5)];
        let result = evaluate(&[confident.clone()], &event(None), &weak, Utc::now());
        assert!(result.triggered.is_empty());

        let result = evaluate(&[confident], &event(None), &[], Utc::now());
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn camera_ids_restrict_firing() {
        let mut scoped = rule("scoped", AlertSeverity::Medium);
        scoped.camera_ids = Some(vec!["backyard".to_string()]);
        let result = evaluate(&[scoped.clone()], &event(None), &[], Utc::now());
        assert!(result.triggered.is_empty());

        scoped.camera_ids = Some(vec!["front_door".to_string(), "backyard".to_string()]);
        let result = evaluate(&[scoped.clone()], &event(None), &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);

        // Empty list applies to all cameras.
        scoped.camera_ids = Some(Vec::new());
        let result = evaluate(&[scoped], &event(None), &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);
    }

    #[test]
    fn all_conditions_must_match() {
        let mut strict = rule("strict", AlertSeverity::High);
        strict.risk_threshold = Some(70);
        strict.object_types = Some(vec!["person".to_string()]);
        strict.min_confidence = Some(0.9);

        let detections = vec![detection("person", 0.95)];
        let result = evaluate(&[strict.clone()], &event(Some(80)), &detections, Utc::now());
        assert_eq!(result.triggered.len(), 1);
        assert_eq!(result.triggered[0].matched_conditions.len(), 3);

        // One failing condition blocks the rule.
        let weak = vec![detection("person", 0.5)];
        let result = evaluate(&[strict], &event(Some(80)), &weak, Utc::now());
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn zone_ids_do_not_block_firing() {
        let mut zoned = rule("zoned", AlertSeverity::Medium);
        zoned.zone_ids = Some(vec!["entry_zone".to_string()]);
        let result = evaluate(&[zoned], &event(None), &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);
    }

    #[test]
    fn schedule_condition_gates_by_time() {
        let mut nightly = rule("nightly", AlertSeverity::High);
        nightly.schedule = Some(Schedule {
            timezone: Some("UTC".to_string()),
            days: None,
            start_time: Some("22:00".to_string()),
            end_time: Some("06:00".to_string()),
        });

        let inside = Utc.with_ymd_and_hms(2026, 3, 3, 2, 30, 0).unwrap();
        let result = evaluate(&[nightly.clone()], &event(None), &[], inside);
        assert_eq!(result.triggered.len(), 1);
        assert_eq!(
            result.triggered[0].matched_conditions,
            vec!["within_schedule".to_string()]
        );

        let outside = Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap();
        let result = evaluate(&[nightly], &event(None), &[], outside);
        assert!(result.triggered.is_empty());
    }

    #[test]
    fn triggered_rules_sort_by_severity_then_name() {
        let rules = vec![
            rule("bravo", AlertSeverity::Medium),
            rule("alpha", AlertSeverity::Medium),
            rule("zulu", AlertSeverity::Critical),
            rule("mike", AlertSeverity::High),
        ];
        let result = evaluate(&rules, &event(None), &[], Utc::now());
        let names: Vec<&str> = result
            .triggered
            .iter()
            .map(|t| t.rule.name.as_str())
            .collect();
        assert_eq!(names, vec!["zulu", "mike", "alpha", "bravo"]);
    }

    #[test]
    fn invalid_dedup_template_result_skips_only_that_rule() {
        let mut broken = rule("broken", AlertSeverity::High);
        // Expands to a key with a forbidden space via the camera id.
        broken.dedup_key_template = "{camera_id}:{rule_id}".to_string();
        let mut spaced_event = event(None);
        spaced_event.camera_id = "front door".to_string();

        // The healthy rule's key avoids the camera id entirely.
        let mut healthy = rule("healthy", AlertSeverity::Low);
        healthy.dedup_key_template = "{rule_id}".to_string();

        let result = evaluate(&[broken, healthy], &spaced_event, &[], Utc::now());
        assert_eq!(result.triggered.len(), 1);
        assert_eq!(result.triggered[0].rule.name, "healthy");
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].0.name, "broken");
        assert!(result.skipped[0].1.starts_with("evaluation_error:"));
    }

    #[test]
    fn dedup_key_uses_first_detection_object_type() {
        let mut typed = rule("typed", AlertSeverity::Medium);
        typed.dedup_key_template = "{camera_id}:{object_type}".to_string();

        let detections = vec![detection("vehicle", 0.7), detection("person", 0.9)];
        let result = evaluate(&[typed.clone()], &event(None), &detections, Utc::now());
        assert_eq!(result.triggered[0].dedup_key, "front_door:vehicle");

        let result = evaluate(&[typed], &event(None), &[], Utc::now());
        assert_eq!(result.triggered[0].dedup_key, "front_door:unknown");
    }

    #[test]
    fn test_rule_against_events_reports_per_event_outcomes() {
        let mut guarded = rule("risk", AlertSeverity::High);
        guarded.risk_threshold = Some(70);

        let mut low = event(Some(10));
        low.id = 1;
        let mut high = event(Some(90));
        high.id = 2;

        let outcomes = test_rule_against_events(
            &guarded,
            &[(low, Vec::new()), (high, Vec::new())],
            Utc::now(),
        );
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].matched);
        assert!(outcomes[0].matched_conditions.is_empty());
        assert!(outcomes[1].matched);
        assert_eq!(
            outcomes[1].matched_conditions,
            vec!["risk_score >= 70".to_string()]
        );
    }
}
