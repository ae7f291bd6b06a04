// src/rules/engine.rs
//! Directive-driven rule engine
//!
//! Compiled once at startup and shared by every exchange. Each exchange gets
//! a [`DirectiveSession`] that remembers which rules already fired and what
//! matched, and the logging phase turns that into one audit record.

use crate::inspection::context::Facts;
use crate::inspection::engine::{EvaluationOutcome, RuleEngine};
use crate::inspection::phase::Phase;
use crate::rules::directive::{Disposition, EngineMode, Rule, RuleSet};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Log target of audit records
pub const AUDIT_TARGET: &str = "inspector_gate::audit";

/// A rule that matched during an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub phase: Phase,
    pub msg: Option<String>,
    pub disruptive: bool,
}

/// Per-exchange state of the directive engine
#[derive(Debug)]
pub struct DirectiveSession {
    started_at: DateTime<Utc>,
    fired: Vec<bool>,
    matches: Vec<RuleMatch>,
    interrupted_by: Option<String>,
}

impl DirectiveSession {
    pub fn matches(&self) -> &[RuleMatch] {
        &self.matches
    }

    pub fn interrupted_by(&self) -> Option<&str> {
        self.interrupted_by.as_deref()
    }
}

/// One line of the audit log
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub exchange_id: Ulid,
    pub duration_ms: i64,
    pub client: Option<SocketAddr>,
    pub host: Option<&'a str>,
    pub method: Option<&'a str>,
    pub uri: Option<&'a str>,
    pub response_status: Option<u16>,
    pub interrupted_by: Option<&'a str>,
    pub matches: &'a [RuleMatch],
}

/// Rule engine over compiled directive text
#[derive(Debug)]
pub struct DirectiveEngine {
    rules: RuleSet,
}

impl DirectiveEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Compile directive text into an engine
    pub fn from_directives(text: &str) -> Result<Self> {
        let rules = RuleSet::parse(text)?;
        info!(
            "Compiled {} rules (engine mode {:?})",
            rules.rules.len(),
            rules.mode
        );
        Ok(Self::new(rules))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.rules.len()
    }

    pub fn mode(&self) -> EngineMode {
        self.rules.mode
    }

    fn body_access_allows(&self, rule: &Rule) -> bool {
        (self.rules.request_body_access || !rule.reads_request_body())
            && (self.rules.response_body_access || !rule.reads_response_body())
    }

    fn rule_matches(rule: &Rule, facts: &Facts) -> bool {
        rule.variables
            .iter()
            .flat_map(|variable| variable.extract(facts))
            .any(|value| rule.matches_value(value))
    }

    fn audit(&self, session: &DirectiveSession, facts: &Facts) {
        let now = Utc::now();
        let record = AuditRecord {
            timestamp: now,
            exchange_id: facts.exchange_id,
            duration_ms: (now - session.started_at).num_milliseconds(),
            client: facts.client_addr,
            host: facts.host.as_deref(),
            method: facts.method.as_deref(),
            uri: facts.uri.as_deref(),
            response_status: facts.response_status,
            interrupted_by: session.interrupted_by.as_deref(),
            matches: &session.matches,
        };

        match serde_json::to_string(&record) {
            Ok(line) => info!(target: AUDIT_TARGET, "{}", line),
            Err(e) => warn!("Failed to serialize audit record: {}", e),
        }
    }
}

#[async_trait]
impl RuleEngine for DirectiveEngine {
    type Session = DirectiveSession;

    fn begin_session(&self) -> Self::Session {
        DirectiveSession {
            started_at: Utc::now(),
            fired: vec![false; self.rules.rules.len()],
            matches: Vec::new(),
            interrupted_by: None,
        }
    }

    async fn evaluate(
        &self,
        session: &mut Self::Session,
        phase: Phase,
        facts: &Facts,
    ) -> Result<EvaluationOutcome> {
        if self.rules.mode == EngineMode::Off {
            return Ok(EvaluationOutcome::Continue);
        }

        if let Some(rule_id) = &session.interrupted_by {
            if phase != Phase::Logging {
                return Ok(EvaluationOutcome::error(format!(
                    "phase {} evaluated after rule {} interrupted",
                    phase, rule_id
                )));
            }
        }

        let blocking = self.rules.mode == EngineMode::On && phase != Phase::Logging;

        for (idx, rule) in self.rules.rules.iter().enumerate() {
            if session.fired[idx] || rule.fires_at() > phase {
                continue;
            }
            session.fired[idx] = true;

            // Rules whose own phase never ran are not matched late at Logging.
            if phase == Phase::Logging && rule.fires_at() != Phase::Logging {
                continue;
            }

            if !self.body_access_allows(rule) || !Self::rule_matches(rule, facts) {
                continue;
            }

            let disruptive = rule.disposition == Disposition::Deny;
            if rule.log {
                debug!(rule_id = %rule.id, %phase, "Rule matched");
            }
            session.matches.push(RuleMatch {
                rule_id: rule.id.clone(),
                phase,
                msg: rule.msg.clone(),
                disruptive,
            });

            if disruptive && blocking {
                session.interrupted_by = Some(rule.id.clone());
                return Ok(EvaluationOutcome::Interrupt {
                    status: Some(rule.status.unwrap_or(self.rules.default_status)),
                    reason: rule
                        .msg
                        .clone()
                        .unwrap_or_else(|| format!("Matched rule {}", rule.id)),
                    rule_id: Some(rule.id.clone()),
                });
            }
        }

        if phase == Phase::Logging {
            self.audit(session, facts);
        }

        Ok(EvaluationOutcome::Continue)
    }

    fn end_session(&self, session: Self::Session) -> Result<()> {
        debug!(
            matches = session.matches.len(),
            interrupted = session.interrupted_by.is_some(),
            "Directive session closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspection::context::{CaptureLimits, EvaluationContext, PhaseData};
    use crate::utils::config::DEFAULT_DIRECTIVES;
    use bytes::Bytes;
    use std::sync::Arc;

    fn context(text: &str) -> EvaluationContext<DirectiveEngine> {
        let engine = Arc::new(DirectiveEngine::from_directives(text).unwrap());
        EvaluationContext::create(engine, CaptureLimits::default())
    }

    fn record_request(ctx: &mut EvaluationContext<DirectiveEngine>, uri: &str) {
        ctx.record(
            Phase::Connection,
            PhaseData::Connection {
                client_addr: "10.0.0.1:1234".parse().unwrap(),
                host: Some("app.local".into()),
                secure: false,
            },
        )
        .unwrap();
        ctx.record(
            Phase::RequestUri,
            PhaseData::RequestLine {
                method: "GET".into(),
                uri: uri.into(),
                protocol: "HTTP/1.1".into(),
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_admin_uri_interrupts_at_request_uri() {
        let mut ctx = context(DEFAULT_DIRECTIVES);
        record_request(&mut ctx, "/admin/settings");

        assert!(ctx.evaluate(Phase::Connection).await.unwrap().is_continue());
        let outcome = ctx.evaluate(Phase::RequestUri).await.unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::interrupt(403, "Admin access denied", "1")
        );
    }

    #[tokio::test]
    async fn test_clean_uri_continues() {
        let mut ctx = context(DEFAULT_DIRECTIVES);
        record_request(&mut ctx, "/products");

        for phase in Phase::ALL {
            assert!(ctx.evaluate(phase).await.unwrap().is_continue());
        }
    }

    #[tokio::test]
    async fn test_detection_only_never_interrupts() {
        let mut ctx = context(
            "SecRuleEngine DetectionOnly\n\
             SecRule REQUEST_URI \"@contains /admin\" \"id:1,phase:1,deny\"",
        );
        record_request(&mut ctx, "/admin");

        assert!(ctx.evaluate(Phase::RequestUri).await.unwrap().is_continue());
    }

    #[tokio::test]
    async fn test_engine_off() {
        let mut ctx = context(
            "SecRuleEngine Off\n\
             SecRule REQUEST_URI \"@contains /admin\" \"id:1,phase:1,deny\"",
        );
        record_request(&mut ctx, "/admin");

        assert!(ctx.evaluate(Phase::RequestUri).await.unwrap().is_continue());
    }

    #[tokio::test]
    async fn test_body_rules_need_body_access() {
        let rule = "SecRule REQUEST_BODY \"@contains DROP TABLE\" \"id:5,phase:2,deny,status:406\"";

        let mut ctx = context(rule);
        ctx.record(Phase::RequestBody, PhaseData::BodyChunk(Bytes::from_static(b"1; DROP TABLE users")))
            .unwrap();
        assert!(ctx.evaluate(Phase::RequestBody).await.unwrap().is_continue());

        let mut ctx = context(&format!("SecRequestBodyAccess On\n{}", rule));
        ctx.record(Phase::RequestBody, PhaseData::BodyChunk(Bytes::from_static(b"1; DROP TABLE users")))
            .unwrap();
        let outcome = ctx.evaluate(Phase::RequestBody).await.unwrap();
        assert!(matches!(
            outcome,
            EvaluationOutcome::Interrupt { status: Some(406), .. }
        ));
    }

    #[tokio::test]
    async fn test_default_status_and_reason() {
        let mut ctx = context(
            "SecDefaultStatus 418\n\
             SecRule REQUEST_METHOD \"@streq TRACE\" \"id:7,phase:1,deny\"",
        );
        ctx.record(
            Phase::RequestUri,
            PhaseData::RequestLine {
                method: "TRACE".into(),
                uri: "/".into(),
                protocol: "HTTP/1.1".into(),
            },
        )
        .unwrap();

        let outcome = ctx.evaluate(Phase::RequestUri).await.unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::Interrupt {
                status: Some(418),
                reason: "Matched rule 7".to_string(),
                rule_id: Some("7".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_evaluate_after_interrupt_is_error() {
        let mut ctx = context(DEFAULT_DIRECTIVES);
        record_request(&mut ctx, "/admin");
        ctx.evaluate(Phase::RequestUri).await.unwrap();

        let outcome = ctx.evaluate(Phase::RequestHeaders).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Error { .. }));
        // Logging stays available for audit
        assert!(ctx.evaluate(Phase::Logging).await.unwrap().is_continue());
    }

    #[tokio::test]
    async fn test_rules_fire_once_and_pass_is_recorded() {
        let engine = DirectiveEngine::from_directives(
            "SecRule REQUEST_HEADERS:User-Agent \"@pm curl\" \"id:9,phase:1,pass,msg:'scripted client'\"",
        )
        .unwrap();
        let mut session = engine.begin_session();

        let mut facts = Facts::new(CaptureLimits::default());
        facts.request_headers.push(("user-agent".into(), "curl/8.4".into()));

        engine
            .evaluate(&mut session, Phase::RequestHeaders, &facts)
            .await
            .unwrap();
        engine
            .evaluate(&mut session, Phase::RequestBody, &facts)
            .await
            .unwrap();

        assert_eq!(session.matches().len(), 1);
        assert_eq!(session.matches()[0].msg.as_deref(), Some("scripted client"));
        assert!(!session.matches()[0].disruptive);
        assert_eq!(session.interrupted_by(), None);
        engine.end_session(session).unwrap();
    }

    #[tokio::test]
    async fn test_response_status_rule() {
        let mut ctx = context(
            "SecRule RESPONSE_STATUS \"@gt 499\" \"id:40,phase:3,deny,msg:'backend failure'\"",
        );
        ctx.record(
            Phase::ResponseHeaders,
            PhaseData::ResponseHead {
                status: 503,
                headers: Vec::new(),
            },
        )
        .unwrap();

        let outcome = ctx.evaluate(Phase::ResponseHeaders).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Interrupt { .. }));
    }

    #[tokio::test]
    async fn test_logging_skips_rules_of_unreached_phases() {
        let engine = DirectiveEngine::from_directives(
            "SecRequestBodyAccess On\n\
             SecResponseBodyAccess On\n\
             SecRule REQUEST_URI \"@contains /admin\" \"id:1,phase:1,deny\"\n\
             SecRule REQUEST_BODY \"!@contains token\" \"id:2,phase:2,deny,msg:'missing token'\"\n\
             SecRule RESPONSE_BODY \"!@contains ok\" \"id:3,phase:4,pass\"\n\
             SecRule REQUEST_METHOD \"@streq GET\" \"id:4,phase:5,pass,msg:'audited'\"",
        )
        .unwrap();
        let mut session = engine.begin_session();

        let mut facts = Facts::new(CaptureLimits::default());
        facts.method = Some("GET".into());
        facts.uri = Some("/admin".into());

        let outcome = engine
            .evaluate(&mut session, Phase::RequestUri, &facts)
            .await
            .unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Interrupt { .. }));

        let outcome = engine
            .evaluate(&mut session, Phase::Logging, &facts)
            .await
            .unwrap();
        assert!(outcome.is_continue());

        let matched: Vec<(&str, Phase)> = session
            .matches()
            .iter()
            .map(|m| (m.rule_id.as_str(), m.phase))
            .collect();
        assert_eq!(matched, vec![("1", Phase::RequestUri), ("4", Phase::Logging)]);
        assert_eq!(session.interrupted_by(), Some("1"));
        engine.end_session(session).unwrap();
    }
}
