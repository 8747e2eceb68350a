use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use regex::Regex;
use tracing::{info, warn};

use steward_core::config::{QualityConfig, TargetLanguage};
use steward_core::domain::message::SessionId;

use crate::llm::{ModelRequest, ModelResponse};
use crate::prompts::PromptRenderer;

const FILLER_PHRASES: [&str; 7] = [
    "作为一个AI",
    "作为AI模型",
    "作为人工智能",
    "我无法确定",
    "我没有能力",
    "As an AI",
    "I cannot determine",
];
const FILLER_PENALTY: f64 = 0.15;
const FILLER_PENALTY_CAP: f64 = 0.4;
const PRIVACY_PENALTY: f64 = 0.5;
const LANGUAGE_PENALTY: f64 = 0.2;
const SHORT_PENALTY: f64 = 0.1;

const CARD_PATTERN: &str = r"\b[0-9]{4}[\s-]?[0-9]{4}[\s-]?[0-9]{4}[\s-]?[0-9]{4}\b";
const PHONE_PATTERN: &str = r"\b1[3-9][0-9]{9}\b";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QualityIssue {
    EmptyResponse,
    FillerPhrases(usize),
    PrivacyLeak,
    LanguageMismatch,
    TooShort,
}

impl QualityIssue {
    pub fn tag(&self) -> String {
        match self {
            Self::EmptyResponse => "empty_response".to_string(),
            Self::FillerPhrases(count) => format!("filler_phrases({count})"),
            Self::PrivacyLeak => "privacy_leak".to_string(),
            Self::LanguageMismatch => "language_mismatch".to_string(),
            Self::TooShort => "too_short".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityVerdict {
    pub score: f64,
    pub issues: Vec<QualityIssue>,
    pub passed: bool,
}

impl QualityVerdict {
    pub fn privacy_leak(&self) -> bool {
        self.issues.contains(&QualityIssue::PrivacyLeak)
    }

    pub fn issue_tags(&self) -> Vec<String> {
        self.issues.iter().map(QualityIssue::tag).collect()
    }

    /// Leak-free beats leaking; within the same class the higher score wins.
    /// Ties keep the incumbent.
    fn outranks(&self, other: &Self) -> bool {
        match (self.privacy_leak(), other.privacy_leak()) {
            (false, true) => true,
            (true, false) => false,
            _ => self.score > other.score,
        }
    }
}

/// Deterministic, model-free scoring of one reply.
pub struct QualityRules {
    config: QualityConfig,
    privacy_patterns: Vec<Regex>,
}

impl QualityRules {
    pub fn new(config: QualityConfig) -> Result<Self, regex::Error> {
        let privacy_patterns = vec![Regex::new(CARD_PATTERN)?, Regex::new(PHONE_PATTERN)?];
        Ok(Self { config, privacy_patterns })
    }

    pub fn score(&self, text: &str) -> QualityVerdict {
        let trimmed_len = text.trim().chars().count();
        if trimmed_len < self.config.min_length {
            return QualityVerdict {
                score: 0.0,
                issues: vec![QualityIssue::EmptyResponse],
                passed: false,
            };
        }

        let mut score = 1.0;
        let mut issues = Vec::new();

        let filler_count = FILLER_PHRASES.iter().filter(|phrase| text.contains(**phrase)).count();
        if filler_count > 0 {
            score -= (filler_count as f64 * FILLER_PENALTY).min(FILLER_PENALTY_CAP);
            issues.push(QualityIssue::FillerPhrases(filler_count));
        }

        if self.privacy_patterns.iter().any(|pattern| pattern.is_match(text)) {
            score -= PRIVACY_PENALTY;
            issues.push(QualityIssue::PrivacyLeak);
        }

        if self.language_mismatch(text) {
            score -= LANGUAGE_PENALTY;
            issues.push(QualityIssue::LanguageMismatch);
        }

        if trimmed_len > self.config.min_length && trimmed_len < self.config.short_length {
            score -= SHORT_PENALTY;
            issues.push(QualityIssue::TooShort);
        }

        let score: f64 = score.max(0.0);
        let passed =
            score >= self.config.pass_threshold && !issues.contains(&QualityIssue::PrivacyLeak);
        QualityVerdict { score, issues, passed }
    }

    fn language_mismatch(&self, text: &str) -> bool {
        let total = text.chars().count();
        if total <= self.config.language_check_min_chars {
            return false;
        }
        let matching = match self.config.target_language {
            TargetLanguage::Zh => {
                text.chars().filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c)).count()
            }
            TargetLanguage::En => text.chars().filter(char::is_ascii_alphabetic).count(),
            TargetLanguage::Any => return false,
        };
        (matching as f64 / total as f64) < self.config.min_language_ratio
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GuardedResponse {
    pub response: ModelResponse,
    /// `None` when the reply carried no scorable text or the guard is disabled.
    pub verdict: Option<QualityVerdict>,
    pub attempts: u32,
    /// False when the retry budget ran out and the best fallback was returned.
    pub accepted: bool,
}

pub struct QualityGuard {
    rules: QualityRules,
    config: QualityConfig,
    prompts: Arc<PromptRenderer>,
}

impl QualityGuard {
    pub fn new(config: QualityConfig, prompts: Arc<PromptRenderer>) -> Result<Self, regex::Error> {
        Ok(Self { rules: QualityRules::new(config.clone())?, config, prompts })
    }

    pub fn rules(&self) -> &QualityRules {
        &self.rules
    }

    /// Calls `invoke` with the request and, while replies fail the rules,
    /// again with an escalating correction directive. A failure of the first
    /// call is returned; later failures end the loop with the best reply so far.
    pub async fn run<F, Fut>(
        &self,
        session_id: &SessionId,
        request: ModelRequest,
        mut invoke: F,
    ) -> Result<GuardedResponse>
    where
        F: FnMut(ModelRequest) -> Fut,
        Fut: Future<Output = Result<ModelResponse>>,
    {
        if !self.config.enabled {
            let response = invoke(request).await?;
            return Ok(GuardedResponse { response, verdict: None, attempts: 1, accepted: true });
        }

        let max_attempts = 1 + self.config.max_retries;
        let mut best: Option<(ModelResponse, QualityVerdict)> = None;
        let mut previous: Option<QualityVerdict> = None;
        let mut attempts = 0;

        for attempt in 0..max_attempts {
            let attempt_request = match &previous {
                None => request.clone(),
                Some(verdict) => match self.prompts.retry_directive(
                    attempt + 1,
                    verdict.score,
                    &verdict.issue_tags(),
                    self.config.target_language,
                ) {
                    Ok(directive) => request.with_directive(&directive),
                    Err(error) => {
                        warn!(
                            event_name = "agent.quality.directive_failed",
                            session_id = %session_id.0,
                            error = %error,
                            "could not render retry directive; keeping best reply"
                        );
                        break;
                    }
                },
            };

            let response = match invoke(attempt_request).await {
                Ok(response) => response,
                Err(error) if attempt == 0 => return Err(error),
                Err(error) => {
                    warn!(
                        event_name = "agent.quality.retry_failed",
                        session_id = %session_id.0,
                        attempt = attempt + 1,
                        error = %error,
                        "retry call failed; keeping best reply"
                    );
                    break;
                }
            };
            attempts = attempt + 1;

            let Some(text) = response.extractable_text() else {
                return Ok(GuardedResponse { response, verdict: None, attempts, accepted: true });
            };
            let verdict = self.rules.score(text);
            info!(
                event_name = "agent.quality.scored",
                session_id = %session_id.0,
                attempt = attempts,
                max_attempts,
                score = verdict.score,
                issues = %verdict.issue_tags().join(","),
                passed = verdict.passed,
                "scored model reply"
            );

            if verdict.passed {
                return Ok(GuardedResponse {
                    response,
                    verdict: Some(verdict),
                    attempts,
                    accepted: true,
                });
            }

            let replace = best.as_ref().map_or(true, |(_, incumbent)| verdict.outranks(incumbent));
            previous = Some(verdict.clone());
            if replace {
                best = Some((response, verdict));
            }
        }

        let (response, verdict) =
            best.ok_or_else(|| anyhow!("quality guard finished without any reply"))?;
        warn!(
            event_name = "agent.quality.budget_exhausted",
            session_id = %session_id.0,
            attempts,
            best_score = verdict.score,
            "retry budget exhausted; returning best reply"
        );
        Ok(GuardedResponse { response, verdict: Some(verdict), attempts, accepted: false })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use steward_core::config::{QualityConfig, TargetLanguage};
    use steward_core::domain::message::SessionId;

    use super::{QualityGuard, QualityIssue, QualityRules};
    use crate::llm::{ModelRequest, ModelResponse, ToolCall};
    use crate::prompts::PromptRenderer;

    const GOOD_ZH: &str = "您的订单 ORD1 已于昨天发货，预计三天内送达，请留意快递通知。";

    fn rules() -> QualityRules {
        QualityRules::new(QualityConfig::default()).expect("patterns")
    }

    fn guard(config: QualityConfig) -> QualityGuard {
        QualityGuard::new(config, Arc::new(PromptRenderer::new().expect("templates")))
            .expect("guard")
    }

    fn scripted(
        replies: Vec<anyhow::Result<ModelResponse>>,
    ) -> (Arc<Mutex<VecDeque<anyhow::Result<ModelResponse>>>>, Arc<Mutex<Vec<ModelRequest>>>) {
        (Arc::new(Mutex::new(replies.into())), Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn under_minimum_length_scores_zero() {
        let verdict = rules().score("  好的  ");
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.issues, vec![QualityIssue::EmptyResponse]);
        assert!(!verdict.passed);
    }

    #[test]
    fn filler_phrases_are_penalized_per_phrase_with_cap() {
        let one = rules().score("作为一个AI，我可以告诉你订单 ORD1 已经发货，预计明天送达。");
        assert!((one.score - 0.85).abs() < 1e-9);
        assert_eq!(one.issue_tags(), vec!["filler_phrases(1)"]);

        let many = rules().score("作为一个AI作为AI模型作为人工智能我无法确定我没有能力回答这个关于订单的问题。");
        assert!((many.score - 0.6).abs() < 1e-9);
        assert_eq!(many.issues[0], QualityIssue::FillerPhrases(5));
    }

    #[test]
    fn privacy_leak_never_passes() {
        let verdict = rules().score("已为您查询，绑定的银行卡为 6222 0212 3456 7890，请核对。");
        assert!(verdict.privacy_leak());
        assert!(!verdict.passed);
        assert!((verdict.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn latin_reply_fails_chinese_language_check() {
        let verdict =
            rules().score("Your order ORD1 has shipped yesterday and should arrive within three days.");
        assert_eq!(verdict.issues, vec![QualityIssue::LanguageMismatch]);
        assert!((verdict.score - 0.8).abs() < 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn language_check_follows_configured_target() {
        let english = QualityRules::new(QualityConfig {
            target_language: TargetLanguage::En,
            ..QualityConfig::default()
        })
        .expect("patterns");
        let verdict =
            english.score("Your order ORD1 has shipped yesterday and should arrive within three days.");
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn short_reply_gets_small_penalty() {
        let verdict = rules().score("订单 ORD1 已经发货了，请放心等待");
        assert_eq!(verdict.issues, vec![QualityIssue::TooShort]);
        assert!((verdict.score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_reply_triggers_retry_with_directive() {
        let (replies, seen) =
            scripted(vec![Ok(ModelResponse::text("")), Ok(ModelResponse::text(GOOD_ZH))]);
        let guard = guard(QualityConfig::default());
        let request = ModelRequest::new("base instructions", Vec::new());

        let result = guard
            .run(&SessionId("s-1".to_string()), request, |request| {
                seen.lock().expect("seen").push(request);
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect("guarded reply");

        assert_eq!(result.response.text, GOOD_ZH);
        assert_eq!(result.attempts, 2);
        assert!(result.accepted);
        let seen = seen.lock().expect("seen");
        assert_eq!(seen[0].system_prompt, "base instructions");
        assert!(seen[1].system_prompt.starts_with("base instructions\n\n"));
        assert!(seen[1].system_prompt.contains("empty_response"));
    }

    #[tokio::test]
    async fn leak_free_reply_wins_over_higher_scoring_leak() {
        let leaking = "您的手机号 13812345678 已绑定订单 ORD1，订单已经发货，预计三天内送达。";
        let weak_but_clean =
            "As an AI, I cannot determine the exact hour, but 作为一个AI I see order ORD1 has shipped.";
        let (replies, _) = scripted(vec![
            Ok(ModelResponse::text(weak_but_clean)),
            Ok(ModelResponse::text(leaking)),
            Ok(ModelResponse::text(leaking)),
        ]);
        let guard = guard(QualityConfig { pass_threshold: 0.9, ..QualityConfig::default() });

        let result = guard
            .run(&SessionId("s-1".to_string()), ModelRequest::new("base", Vec::new()), |_| {
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect("guarded reply");

        assert_eq!(result.response.text, weak_but_clean);
        assert!(!result.accepted);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn retry_that_ties_the_best_score_keeps_the_earlier_reply() {
        let first = "Your order ORD1 has shipped yesterday and should arrive within three days.";
        let second = "Your order ORD1 left our warehouse yesterday and arrives within three days.";
        let third = "Your order ORD1 was handed to the courier and should arrive in three days.";
        let (replies, _) = scripted(vec![
            Ok(ModelResponse::text(first)),
            Ok(ModelResponse::text(second)),
            Ok(ModelResponse::text(third)),
        ]);
        let guard = guard(QualityConfig { pass_threshold: 0.9, ..QualityConfig::default() });

        let result = guard
            .run(&SessionId("s-1".to_string()), ModelRequest::new("base", Vec::new()), |_| {
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect("guarded reply");

        assert_eq!(result.attempts, 3);
        assert!(!result.accepted);
        assert_eq!(result.response.text, first);
        let verdict = result.verdict.expect("scored");
        assert!((verdict.score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pure_tool_call_returns_without_scoring() {
        let tool_reply = ModelResponse::default().with_tool_call(ToolCall {
            id: "call-1".to_string(),
            name: "query_order_status".to_string(),
            arguments: serde_json::json!({ "order_no": "ORD1" }),
        });
        let (replies, _) = scripted(vec![Ok(tool_reply.clone())]);
        let guard = guard(QualityConfig::default());

        let result = guard
            .run(&SessionId("s-1".to_string()), ModelRequest::new("base", Vec::new()), |_| {
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect("guarded reply");

        assert_eq!(result.response, tool_reply);
        assert_eq!(result.verdict, None);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn first_call_failure_is_fatal_but_retry_failure_keeps_best() {
        let guard = guard(QualityConfig::default());

        let (replies, _) = scripted(vec![Err(anyhow!("model down"))]);
        let error = guard
            .run(&SessionId("s-1".to_string()), ModelRequest::new("base", Vec::new()), |_| {
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect_err("first failure propagates");
        assert!(error.to_string().contains("model down"));

        let (replies, _) =
            scripted(vec![Ok(ModelResponse::text("短")), Err(anyhow!("timeout on retry"))]);
        let result = guard
            .run(&SessionId("s-1".to_string()), ModelRequest::new("base", Vec::new()), |_| {
                let reply = replies.lock().expect("replies").pop_front();
                async move { reply.unwrap_or_else(|| Err(anyhow!("script exhausted"))) }
            })
            .await
            .expect("fallback reply");
        assert_eq!(result.response.text, "短");
        assert!(!result.accepted);
    }
}
