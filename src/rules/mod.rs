// src/rules/mod.rs
//! Directive rule engine
//!
//! A [`RuleEngine`](crate::inspection::RuleEngine) implementation driven by a
//! ModSecurity-style directive text:
//!
//! - **Directive**: parser and compiled rule set
//! - **Variable**: which recorded facts a rule reads
//! - **Operator**: how values are matched, plus `t:` transformations
//! - **Engine**: per-exchange sessions and audit records

pub mod directive;
pub mod engine;
pub mod operator;
pub mod variable;

pub use directive::{Disposition, EngineMode, Rule, RuleSet};
pub use engine::{AuditRecord, DirectiveEngine, DirectiveSession, RuleMatch};
pub use operator::{Operator, Transform};
pub use variable::Variable;
