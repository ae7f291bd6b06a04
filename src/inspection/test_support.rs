// src/inspection/test_support.rs
//! Scripted rule engine for unit tests

use crate::inspection::context::Facts;
use crate::inspection::engine::{EvaluationOutcome, RuleEngine};
use crate::inspection::phase::Phase;
use crate::utils::errors::{InspectorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What the engine answers for a phase
#[derive(Debug, Clone)]
pub enum Script {
    Outcome(EvaluationOutcome),
    /// The evaluate call itself fails
    Fail(String),
}

/// Engine whose answers are fixed per phase; unscripted phases continue
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: HashMap<Phase, Script>,
    fail_release: bool,
    begun: AtomicUsize,
    ended: AtomicUsize,
    evaluated: Mutex<Vec<Phase>>,
    last_facts: Mutex<Option<Facts>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, phase: Phase, outcome: EvaluationOutcome) -> Self {
        self.scripts.insert(phase, Script::Outcome(outcome));
        self
    }

    pub fn failing_on(mut self, phase: Phase, detail: &str) -> Self {
        self.scripts.insert(phase, Script::Fail(detail.to_string()));
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn sessions_begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn sessions_ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn evaluated(&self) -> Vec<Phase> {
        self.evaluated.lock().clone()
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.evaluated.lock().iter().filter(|p| **p == phase).count()
    }

    pub fn last_facts(&self) -> Option<Facts> {
        self.last_facts.lock().clone()
    }
}

#[async_trait]
impl RuleEngine for ScriptedEngine {
    type Session = ();

    fn begin_session(&self) -> Self::Session {
        self.begun.fetch_add(1, Ordering::SeqCst);
    }

    async fn evaluate(
        &self,
        _session: &mut Self::Session,
        phase: Phase,
        facts: &Facts,
    ) -> Result<EvaluationOutcome> {
        self.evaluated.lock().push(phase);
        *self.last_facts.lock() = Some(facts.clone());

        match self.scripts.get(&phase) {
            Some(Script::Outcome(outcome)) => Ok(outcome.clone()),
            Some(Script::Fail(detail)) => Err(InspectorError::EngineEvaluation(detail.clone())),
            None => Ok(EvaluationOutcome::Continue),
        }
    }

    fn end_session(&self, _session: Self::Session) -> Result<()> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(InspectorError::SessionRelease("scripted failure".to_string()));
        }
        Ok(())
    }
}
