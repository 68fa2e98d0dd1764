//! Supervisor alert evaluation.
//!
//! The evaluator is a pure function of (call state, event, recent alert
//! history, now): no clocks or I/O inside, so identical ordered inputs always
//! produce identical outputs. Callers read the wall clock once per ingest and
//! pass it through.

use serde_json::{json, Map, Value};

use crate::config::RealtimeConfig;
use crate::model::{metric_f64, RealtimeCall, RealtimeEvent, Severity, SupervisorAlert};

/// Signal assigned when an escalation keyword is present.
const KEYWORD_SIGNAL: f64 = 0.9;

/// Dead-air seconds at which the signal saturates to 1.0.
const DEAD_AIR_SATURATION_S: f64 = 10.0;

/// Dead-air seconds required to fire the `dead_air` rule.
const DEAD_AIR_ALERT_THRESHOLD_S: f64 = 5.0;

/// Post-update scores for a call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreUpdate {
    pub risk_score: f64,
    pub sentiment_score: f64,
}

/// A rule firing that has not yet been persisted.
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub alert_type: &'static str,
    pub severity: Severity,
    pub message: String,
    pub metadata: Map<String, Value>,
}

/// Rule engine configured once at startup.
pub struct AlertEvaluator {
    negative_sentiment_threshold: f64,
    high_risk_threshold: f64,
    cooldown_ms: u64,
    /// Lowercased trigger phrases.
    keywords: Vec<String>,
}

impl AlertEvaluator {
    /// Builds an evaluator from the realtime configuration.
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            negative_sentiment_threshold: config.negative_sentiment_threshold,
            high_risk_threshold: config.high_risk_threshold,
            cooldown_ms: config.alert_cooldown_seconds * 1000,
            keywords: config
                .keyword_triggers
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    /// Evaluates one event against the call's current state.
    ///
    /// Returns the updated scores and any alerts that fired. Alerts already
    /// represented in `recent_alerts` within the cooldown window for the same
    /// type are suppressed, acknowledged or not.
    pub fn evaluate(
        &self,
        call: &RealtimeCall,
        event: &RealtimeEvent,
        recent_alerts: &[SupervisorAlert],
        now_ms: u64,
    ) -> (ScoreUpdate, Vec<AlertDraft>) {
        let matched_keyword = event
            .text
            .as_deref()
            .and_then(|text| self.find_keyword(text));
        let dead_air_s = metric_f64(&event.metadata, "dead_air_seconds");
        let explicit_risk = metric_f64(&event.metadata, "risk");

        let signal = event_signal(
            event.sentiment,
            matched_keyword.is_some(),
            dead_air_s,
            explicit_risk,
        );

        let risk_score = (0.6 * call.risk_score + 0.4 * signal).clamp(0.0, 1.0);
        let sentiment_score = match event.sentiment {
            Some(sentiment) => {
                (0.7 * call.sentiment_score + 0.3 * sentiment).clamp(-1.0, 1.0)
            }
            None => call.sentiment_score,
        };

        let mut drafts = Vec::new();

        if let Some(sentiment) = event.sentiment {
            if sentiment <= self.negative_sentiment_threshold {
                drafts.push(AlertDraft {
                    alert_type: "negative_sentiment",
                    severity: Severity::High,
                    message: format!("Negative sentiment detected ({:.2})", sentiment),
                    metadata: json_map(json!({"sentiment": sentiment})),
                });
            }
        }

        if let Some(keyword) = matched_keyword {
            drafts.push(AlertDraft {
                alert_type: "escalation_keyword",
                severity: Severity::Critical,
                message: format!("Escalation keyword detected: \"{}\"", keyword),
                metadata: json_map(json!({"keyword": keyword})),
            });
        }

        if let Some(dead_air) = dead_air_s {
            if dead_air >= DEAD_AIR_ALERT_THRESHOLD_S {
                drafts.push(AlertDraft {
                    alert_type: "dead_air",
                    severity: Severity::Medium,
                    message: format!("Dead air for {:.1}s", dead_air),
                    metadata: json_map(json!({"dead_air_seconds": dead_air})),
                });
            }
        }

        if risk_score >= self.high_risk_threshold {
            drafts.push(AlertDraft {
                alert_type: "high_risk",
                severity: Severity::High,
                message: format!(
                    "Risk score {:.2} exceeded threshold {:.2}",
                    risk_score, self.high_risk_threshold
                ),
                metadata: json_map(json!({"risk_score": risk_score})),
            });
        }

        drafts.retain(|draft| !self.in_cooldown(draft.alert_type, recent_alerts, now_ms));

        (
            ScoreUpdate {
                risk_score,
                sentiment_score,
            },
            drafts,
        )
    }

    /// Returns the first configured keyword found in `text`, if any.
    fn find_keyword(&self, text: &str) -> Option<&str> {
        let haystack = text.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| contains_word(&haystack, keyword))
            .map(String::as_str)
    }

    /// True when an alert of this type fired within the cooldown window.
    fn in_cooldown(
        &self,
        alert_type: &str,
        recent_alerts: &[SupervisorAlert],
        now_ms: u64,
    ) -> bool {
        recent_alerts.iter().any(|alert| {
            alert.alert_type == alert_type
                && now_ms.saturating_sub(alert.created_at) < self.cooldown_ms
        })
    }
}

/// Derives the risk signal for one event.
///
/// The signal is the max of four independent sources; each is already
/// normalized to [0, 1].
fn event_signal(
    sentiment: Option<f64>,
    keyword_matched: bool,
    dead_air_s: Option<f64>,
    explicit_risk: Option<f64>,
) -> f64 {
    let mut signal = sentiment.map_or(0.0, |s| s.min(0.0).abs().min(1.0));
    if keyword_matched {
        signal = signal.max(KEYWORD_SIGNAL);
    }
    if let Some(dead_air) = dead_air_s {
        signal = signal.max((dead_air / DEAD_AIR_SATURATION_S).clamp(0.0, 1.0));
    }
    if let Some(risk) = explicit_risk {
        signal = signal.max(risk.clamp(0.0, 1.0));
    }
    signal
}

/// Case-sensitive word-boundary containment over a lowercased haystack.
///
/// Multi-word phrases match as-is; boundaries are any non-alphanumeric
/// character or the ends of the string.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(pos) = haystack[search_from..].find(needle) {
        let start = search_from + pos;
        let end = start + needle.len();
        let boundary_before = start == 0
            || haystack[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric());
        let boundary_after = end == haystack.len()
            || haystack[end..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric());
        if boundary_before && boundary_after {
            return true;
        }
        // Advance by one character to stay on a UTF-8 boundary.
        search_from = start
            + haystack[start..]
                .chars()
                .next()
                .map_or(1, |c| c.len_utf8());
    }
    false
}

fn json_map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, Speaker};

    fn evaluator() -> AlertEvaluator {
        AlertEvaluator::from_config(&RealtimeConfig::default())
    }

    fn call(risk: f64, sentiment: f64) -> RealtimeCall {
        let mut call = RealtimeCall::new("RT-1", 0);
        call.risk_score = risk;
        call.sentiment_score = sentiment;
        call
    }

    fn event(text: Option<&str>, sentiment: Option<f64>, metadata: Value) -> RealtimeEvent {
        RealtimeEvent {
            id: 1,
            call_id: "RT-1".into(),
            event_type: EventType::Transcript,
            speaker: Some(Speaker::Customer),
            text: text.map(String::from),
            sentiment,
            confidence: None,
            occurred_at: 0,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn negative_sentiment_fires_high_alert_and_raises_risk() {
        let (scores, drafts) = evaluator().evaluate(
            &call(0.0, 0.0),
            &event(None, Some(-0.8), json!({})),
            &[],
            0,
        );
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].alert_type, "negative_sentiment");
        assert_eq!(drafts[0].severity, Severity::High);
        assert!(scores.risk_score >= 0.32 - 1e-9);
        assert!((scores.sentiment_score - -0.24).abs() < 1e-9);
    }

    #[test]
    fn mild_sentiment_fires_nothing() {
        let (scores, drafts) =
            evaluator().evaluate(&call(0.0, 0.0), &event(None, Some(-0.2), json!({})), &[], 0);
        assert!(drafts.is_empty());
        assert!(scores.risk_score < 0.1);
    }

    #[test]
    fn escalation_stacking_fires_three_rules() {
        let payload = event(
            Some("get me your supervisor"),
            Some(-0.9),
            json!({"metrics": {"dead_air_seconds": 7}}),
        );
        let (scores, drafts) = evaluator().evaluate(&call(0.0, 0.0), &payload, &[], 0);
        let types: Vec<&str> = drafts.iter().map(|d| d.alert_type).collect();
        assert_eq!(
            types,
            vec!["negative_sentiment", "escalation_keyword", "dead_air"]
        );
        assert!((scores.risk_score - 0.36).abs() < 1e-9);
    }

    #[test]
    fn repeated_escalation_crosses_high_risk_threshold() {
        // Risk converges toward 0.9 under repeated 0.9 signals; high_risk
        // must fire on the ingest where it crosses 0.72, with the earlier
        // rules suppressed by cooldown.
        let eval = evaluator();
        let mut current = call(0.0, 0.0);
        let mut history: Vec<SupervisorAlert> = Vec::new();
        let mut high_risk_at = None;

        for round in 0u64..5 {
            let now_ms = round * 10_000;
            let payload = event(
                Some("get me your supervisor"),
                Some(-0.9),
                json!({"metrics": {"dead_air_seconds": 7}}),
            );
            let (scores, drafts) = eval.evaluate(&current, &payload, &history, now_ms);
            current.risk_score = scores.risk_score;
            current.sentiment_score = scores.sentiment_score;
            for (i, draft) in drafts.iter().enumerate() {
                history.push(SupervisorAlert {
                    id: (round * 10 + i as u64) as i64,
                    call_id: "RT-1".into(),
                    alert_type: draft.alert_type.to_string(),
                    severity: draft.severity,
                    message: draft.message.clone(),
                    acknowledged: false,
                    acknowledged_at: None,
                    created_at: now_ms,
                    metadata: Map::new(),
                });
                if draft.alert_type == "high_risk" {
                    high_risk_at = Some(round);
                }
            }
            if round == 0 {
                assert_eq!(drafts.len(), 3);
            }
        }

        assert!(current.risk_score >= 0.72);
        let fired_round = high_risk_at.expect("high_risk never fired");
        assert!(fired_round >= 1, "high_risk cannot fire on first ingest");
    }

    #[test]
    fn cooldown_suppresses_repeat_within_window() {
        let eval = evaluator();
        let first = SupervisorAlert {
            id: 1,
            call_id: "RT-1".into(),
            alert_type: "negative_sentiment".into(),
            severity: Severity::High,
            message: String::new(),
            acknowledged: false,
            acknowledged_at: None,
            created_at: 0,
            metadata: Map::new(),
        };
        // 10s later: inside the 75s window.
        let (_, drafts) = eval.evaluate(
            &call(0.32, -0.24),
            &event(None, Some(-0.8), json!({})),
            &[first.clone()],
            10_000,
        );
        assert!(drafts.iter().all(|d| d.alert_type != "negative_sentiment"));

        // 80s later: window expired, rule re-arms.
        let (_, drafts) = eval.evaluate(
            &call(0.32, -0.24),
            &event(None, Some(-0.8), json!({})),
            &[first],
            80_000,
        );
        assert!(drafts.iter().any(|d| d.alert_type == "negative_sentiment"));
    }

    #[test]
    fn cooldown_is_independent_per_type() {
        let eval = evaluator();
        let history = vec![SupervisorAlert {
            id: 1,
            call_id: "RT-1".into(),
            alert_type: "dead_air".into(),
            severity: Severity::Medium,
            message: String::new(),
            acknowledged: false,
            acknowledged_at: None,
            created_at: 0,
            metadata: Map::new(),
        }];
        let payload = event(
            None,
            Some(-0.8),
            json!({"metrics": {"dead_air_seconds": 6}}),
        );
        let (_, drafts) = eval.evaluate(&call(0.0, 0.0), &payload, &history, 10_000);
        let types: Vec<&str> = drafts.iter().map(|d| d.alert_type).collect();
        assert!(types.contains(&"negative_sentiment"));
        assert!(!types.contains(&"dead_air"));
    }

    #[test]
    fn keyword_matching_honors_word_boundaries() {
        let eval = evaluator();
        // "supervisory" must not match "supervisor".
        let (_, drafts) = eval.evaluate(
            &call(0.0, 0.0),
            &event(Some("in a supervisory role"), None, json!({})),
            &[],
            0,
        );
        assert!(drafts.is_empty());

        let (_, drafts) = eval.evaluate(
            &call(0.0, 0.0),
            &event(Some("SUPERVISOR, now!"), None, json!({})),
            &[],
            0,
        );
        assert_eq!(drafts[0].alert_type, "escalation_keyword");
    }

    #[test]
    fn multi_word_phrase_matches() {
        let eval = evaluator();
        let (_, drafts) = eval.evaluate(
            &call(0.0, 0.0),
            &event(Some("I want to cancel my account today"), None, json!({})),
            &[],
            0,
        );
        assert_eq!(drafts[0].alert_type, "escalation_keyword");
    }

    #[test]
    fn explicit_metric_risk_feeds_signal() {
        let eval = evaluator();
        let payload = event(None, None, json!({"metrics": {"risk": 1.0}}));
        let (scores, _) = eval.evaluate(&call(0.5, 0.0), &payload, &[], 0);
        assert!((scores.risk_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn scores_stay_in_bounds_under_extreme_sequences() {
        let eval = evaluator();
        let mut current = call(0.0, 0.0);
        for i in 0..50 {
            let sentiment = if i % 2 == 0 { -1.0 } else { 1.0 };
            let payload = event(
                Some("supervisor escalate complaint"),
                Some(sentiment),
                json!({"metrics": {"dead_air_seconds": 60, "risk": 5.0}}),
            );
            let (scores, _) = eval.evaluate(&current, &payload, &[], i * 1000);
            assert!((0.0..=1.0).contains(&scores.risk_score));
            assert!((-1.0..=1.0).contains(&scores.sentiment_score));
            current.risk_score = scores.risk_score;
            current.sentiment_score = scores.sentiment_score;
        }
    }

    #[test]
    fn sentiment_unchanged_when_event_has_none() {
        let eval = evaluator();
        let (scores, _) = eval.evaluate(&call(0.2, -0.5), &event(None, None, json!({})), &[], 0);
        assert_eq!(scores.sentiment_score, -0.5);
    }
}
