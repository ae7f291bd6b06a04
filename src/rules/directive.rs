// src/rules/directive.rs
//! Directive text parser
//!
//! Understands a ModSecurity-style subset:
//!
//! ```text
//! SecRuleEngine On|Off|DetectionOnly
//! SecRequestBodyAccess On|Off
//! SecResponseBodyAccess On|Off
//! SecDefaultStatus 403
//! SecRule REQUEST_URI|ARGS "@contains /admin" "id:1,phase:1,deny,status:403,msg:'Admin access denied'"
//! ```
//!
//! Lines ending in `\` continue on the next line; `#` starts a comment.

use crate::inspection::phase::Phase;
use crate::rules::operator::{Operator, Transform};
use crate::rules::variable::Variable;
use crate::utils::errors::{InspectorError, Result};
use std::borrow::Cow;

/// How matches are acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    On,
    Off,
    /// Matches are audited but never interrupt
    DetectionOnly,
}

/// Disruptive action of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Deny,
    Pass,
}

/// One compiled `SecRule`
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    /// Rule phase 1-5
    pub phase: u8,
    pub variables: Vec<Variable>,
    pub operator: Operator,
    pub negated: bool,
    pub disposition: Disposition,
    pub status: Option<u16>,
    pub msg: Option<String>,
    pub transforms: Vec<Transform>,
    pub log: bool,
}

impl Rule {
    /// Pipeline phase at which the rule is evaluated
    ///
    /// The later of the phase named by `phase:` and the phase at which all
    /// of its variables have been recorded.
    pub fn fires_at(&self) -> Phase {
        let floor = match self.phase {
            1 => Phase::Connection,
            2 => Phase::RequestBody,
            3 => Phase::ResponseHeaders,
            4 => Phase::ResponseBody,
            _ => Phase::Logging,
        };

        self.variables
            .iter()
            .map(Variable::available_at)
            .fold(floor, Phase::max)
    }

    pub fn reads_request_body(&self) -> bool {
        self.variables.iter().any(Variable::is_request_body)
    }

    pub fn reads_response_body(&self) -> bool {
        self.variables.iter().any(Variable::is_response_body)
    }

    /// Apply transformations and the operator to one value
    pub fn matches_value(&self, value: Cow<'_, [u8]>) -> bool {
        let value = self
            .transforms
            .iter()
            .fold(value, |value, transform| transform.apply(value));
        self.operator.matches(&value) != self.negated
    }
}

/// Compiled directive text
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub mode: EngineMode,
    pub request_body_access: bool,
    pub response_body_access: bool,
    pub default_status: u16,
    pub rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            mode: EngineMode::On,
            request_body_access: false,
            response_body_access: false,
            default_status: 403,
            rules: Vec::new(),
        }
    }
}

impl RuleSet {
    /// Compile directive text
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = RuleSet::default();

        for (line_no, line) in logical_lines(text) {
            let err = |message: String| InspectorError::RuleParse {
                line: line_no,
                message,
            };

            let tokens = tokenize(&line).map_err(err)?;
            let Some((directive, args)) = tokens.split_first() else {
                continue;
            };

            match directive.as_str() {
                "SecRuleEngine" => {
                    set.mode = match single_arg(directive, args).map_err(err)? {
                        "On" => EngineMode::On,
                        "Off" => EngineMode::Off,
                        "DetectionOnly" => EngineMode::DetectionOnly,
                        other => return Err(err(format!("invalid SecRuleEngine value {:?}", other))),
                    }
                }
                "SecRequestBodyAccess" => {
                    set.request_body_access = on_off(directive, args).map_err(err)?
                }
                "SecResponseBodyAccess" => {
                    set.response_body_access = on_off(directive, args).map_err(err)?
                }
                "SecDefaultStatus" => {
                    let value = single_arg(directive, args).map_err(err)?;
                    set.default_status = parse_status(value).map_err(err)?;
                }
                "SecRule" => {
                    let rule = parse_rule(args).map_err(err)?;
                    if set.rules.iter().any(|r| r.id == rule.id) {
                        return Err(err(format!("duplicate rule id {}", rule.id)));
                    }
                    set.rules.push(rule);
                }
                other => return Err(err(format!("unknown directive {}", other))),
            }
        }

        Ok(set)
    }
}

/// Join continuation lines and drop comments, keeping the starting line number
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        let (start, mut buf) = pending.take().unwrap_or((idx + 1, String::new()));

        if buf.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }

        if let Some(head) = trimmed.strip_suffix('\\') {
            buf.push_str(head);
            buf.push(' ');
            pending = Some((start, buf));
        } else {
            buf.push_str(trimmed);
            lines.push((start, buf));
        }
    }

    if let Some((start, buf)) = pending {
        lines.push((start, buf.trim_end().to_string()));
    }

    lines
}

/// Split on whitespace, honouring double quotes and `\"` escapes
fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted string".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn single_arg<'a>(directive: &str, args: &'a [String]) -> std::result::Result<&'a str, String> {
    match args {
        [value] => Ok(value.as_str()),
        _ => Err(format!("{} takes exactly one argument", directive)),
    }
}

fn on_off(directive: &str, args: &[String]) -> std::result::Result<bool, String> {
    match single_arg(directive, args)? {
        "On" => Ok(true),
        "Off" => Ok(false),
        other => Err(format!("{} expects On or Off, got {:?}", directive, other)),
    }
}

fn parse_status(value: &str) -> std::result::Result<u16, String> {
    value
        .parse::<u16>()
        .ok()
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| format!("invalid status {:?}", value))
}

fn parse_rule(args: &[String]) -> std::result::Result<Rule, String> {
    let [variables, operator, actions] = args else {
        return Err("SecRule expects VARIABLES \"OPERATOR\" \"ACTIONS\"".to_string());
    };

    let variables = variables
        .split('|')
        .map(|token| Variable::parse(token).ok_or_else(|| format!("unknown variable {}", token)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let (negated, operator) = match operator.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, operator.as_str()),
    };
    let operator = Operator::parse(operator)?;

    let mut rule = Rule {
        id: String::new(),
        phase: 2,
        variables,
        operator,
        negated,
        disposition: Disposition::Pass,
        status: None,
        msg: None,
        transforms: Vec::new(),
        log: true,
    };

    for action in split_actions(actions) {
        let (name, value) = match action.split_once(':') {
            Some((name, value)) => (name.trim(), Some(unquote(value.trim()))),
            None => (action.trim(), None),
        };

        match (name, value) {
            ("id", Some(id)) if !id.is_empty() => rule.id = id.to_string(),
            ("phase", Some(phase)) => {
                rule.phase = match phase {
                    "1" => 1,
                    "2" | "request" => 2,
                    "3" => 3,
                    "4" | "response" => 4,
                    "5" | "logging" => 5,
                    other => return Err(format!("invalid phase {:?}", other)),
                }
            }
            ("deny", None) | ("block", None) => rule.disposition = Disposition::Deny,
            ("pass", None) => rule.disposition = Disposition::Pass,
            ("status", Some(status)) => rule.status = Some(parse_status(status)?),
            ("msg", Some(msg)) => rule.msg = Some(msg.to_string()),
            ("t", Some(name)) => match Transform::parse(name)? {
                Some(transform) => rule.transforms.push(transform),
                None => rule.transforms.clear(),
            },
            ("log", None) => rule.log = true,
            ("nolog", None) => rule.log = false,
            (name, _) => return Err(format!("unsupported action {:?}", name)),
        }
    }

    if rule.id.is_empty() {
        return Err("rule is missing an id action".to_string());
    }

    Ok(rule)
}

/// Split on commas outside single quotes
fn split_actions(actions: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (idx, c) in actions.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&actions[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&actions[start..]);

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}
