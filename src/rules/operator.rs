// src/rules/operator.rs
//! Rule operators and value transformations

use regex::bytes::Regex;
use std::borrow::Cow;

/// Match operator of a rule
#[derive(Debug, Clone)]
pub enum Operator {
    Contains(Vec<u8>),
    StrEq(Vec<u8>),
    BeginsWith(Vec<u8>),
    EndsWith(Vec<u8>),
    Rx(Regex),
    /// Case-insensitive match of any phrase
    Pm(Vec<Vec<u8>>),
    Eq(i64),
    Gt(i64),
    Lt(i64),
}

impl Operator {
    /// Parse `@name argument`; a bare argument is a regular expression
    pub fn parse(spec: &str) -> Result<Self, String> {
        let Some(rest) = spec.strip_prefix('@') else {
            return Self::regex(spec);
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let bytes = || arg.as_bytes().to_vec();
        let number = || {
            arg.parse::<i64>()
                .map_err(|_| format!("@{} expects an integer, got {:?}", name, arg))
        };

        match name {
            "contains" => Ok(Operator::Contains(bytes())),
            "streq" => Ok(Operator::StrEq(bytes())),
            "beginsWith" => Ok(Operator::BeginsWith(bytes())),
            "endsWith" => Ok(Operator::EndsWith(bytes())),
            "rx" => Self::regex(arg),
            "pm" => {
                let phrases: Vec<Vec<u8>> = arg
                    .split_whitespace()
                    .map(|p| p.to_ascii_lowercase().into_bytes())
                    .collect();
                if phrases.is_empty() {
                    return Err("@pm needs at least one phrase".to_string());
                }
                Ok(Operator::Pm(phrases))
            }
            "eq" => number().map(Operator::Eq),
            "gt" => number().map(Operator::Gt),
            "lt" => number().map(Operator::Lt),
            other => Err(format!("unsupported operator @{}", other)),
        }
    }

    fn regex(pattern: &str) -> Result<Self, String> {
        Regex::new(pattern)
            .map(Operator::Rx)
            .map_err(|e| format!("invalid regex {:?}: {}", pattern, e))
    }

    pub fn matches(&self, value: &[u8]) -> bool {
        match self {
            Operator::Contains(needle) => contains(value, needle),
            Operator::StrEq(expected) => value == expected.as_slice(),
            Operator::BeginsWith(prefix) => value.starts_with(prefix),
            Operator::EndsWith(suffix) => value.ends_with(suffix),
            Operator::Rx(regex) => regex.is_match(value),
            Operator::Pm(phrases) => {
                let lowered = value.to_ascii_lowercase();
                phrases.iter().any(|p| contains(&lowered, p))
            }
            Operator::Eq(n) => as_number(value).is_some_and(|v| v == *n),
            Operator::Gt(n) => as_number(value).is_some_and(|v| v > *n),
            Operator::Lt(n) => as_number(value).is_some_and(|v| v < *n),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn as_number(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Value transformation applied before matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Lowercase,
    UrlDecode,
}

impl Transform {
    /// Parse a `t:` action value; `none` yields `None`
    pub fn parse(name: &str) -> Result<Option<Self>, String> {
        match name {
            "none" => Ok(None),
            "lowercase" => Ok(Some(Transform::Lowercase)),
            "urlDecode" | "urlDecodeUni" => Ok(Some(Transform::UrlDecode)),
            other => Err(format!("unsupported transformation t:{}", other)),
        }
    }

    pub fn apply<'a>(&self, value: Cow<'a, [u8]>) -> Cow<'a, [u8]> {
        match self {
            Transform::Lowercase => {
                if value.iter().any(u8::is_ascii_uppercase) {
                    Cow::Owned(value.to_ascii_lowercase())
                } else {
                    value
                }
            }
            Transform::UrlDecode => {
                if value.iter().any(|b| *b == b'%' || *b == b'+') {
                    Cow::Owned(url_decode(&value))
                } else {
                    value
                }
            }
        }
    }
}

fn url_decode(input: &[u8]) -> Vec<u8> {
    fn hex(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' if i + 2 < input.len() => {
                match (hex(input[i + 1]), hex(input[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    out
}
