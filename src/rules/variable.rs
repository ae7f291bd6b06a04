// src/rules/variable.rs
//! Rule variables and their extraction from recorded facts

use crate::inspection::context::Facts;
use crate::inspection::phase::Phase;
use std::borrow::Cow;

/// A data source a rule inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    RemoteAddr,
    ServerName,
    RequestMethod,
    RequestUri,
    RequestProtocol,
    QueryString,
    /// All request header values, or only those of one header
    RequestHeaders(Option<String>),
    RequestHeadersNames,
    RequestBody,
    ResponseStatus,
    ResponseHeaders(Option<String>),
    ResponseBody,
}

impl Variable {
    /// Parse one `NAME` or `NAME:selector` token
    pub fn parse(token: &str) -> Option<Self> {
        let (name, selector) = match token.split_once(':') {
            Some((name, selector)) => (name, Some(selector.to_string())),
            None => (token, None),
        };

        let variable = match (name.to_ascii_uppercase().as_str(), selector) {
            ("REMOTE_ADDR", None) => Variable::RemoteAddr,
            ("SERVER_NAME", None) => Variable::ServerName,
            ("REQUEST_METHOD", None) => Variable::RequestMethod,
            ("REQUEST_URI", None) => Variable::RequestUri,
            ("REQUEST_PROTOCOL", None) => Variable::RequestProtocol,
            ("QUERY_STRING", None) => Variable::QueryString,
            ("REQUEST_HEADERS", selector) => Variable::RequestHeaders(selector),
            ("REQUEST_HEADERS_NAMES", None) => Variable::RequestHeadersNames,
            ("REQUEST_BODY", None) => Variable::RequestBody,
            ("RESPONSE_STATUS", None) => Variable::ResponseStatus,
            ("RESPONSE_HEADERS", selector) => Variable::ResponseHeaders(selector),
            ("RESPONSE_BODY", None) => Variable::ResponseBody,
            _ => return None,
        };
        Some(variable)
    }

    /// First pipeline phase at which this variable has been recorded
    pub fn available_at(&self) -> Phase {
        match self {
            Variable::RemoteAddr | Variable::ServerName => Phase::Connection,
            Variable::RequestMethod
            | Variable::RequestUri
            | Variable::RequestProtocol
            | Variable::QueryString => Phase::RequestUri,
            Variable::RequestHeaders(_) | Variable::RequestHeadersNames => Phase::RequestHeaders,
            Variable::RequestBody => Phase::RequestBody,
            Variable::ResponseStatus | Variable::ResponseHeaders(_) => Phase::ResponseHeaders,
            Variable::ResponseBody => Phase::ResponseBody,
        }
    }

    pub fn is_request_body(&self) -> bool {
        matches!(self, Variable::RequestBody)
    }

    pub fn is_response_body(&self) -> bool {
        matches!(self, Variable::ResponseBody)
    }

    /// Current values of this variable; empty when nothing was recorded
    pub fn extract<'a>(&self, facts: &'a Facts) -> Vec<Cow<'a, [u8]>> {
        fn text(value: Option<&str>) -> Vec<Cow<'_, [u8]>> {
            value.map(|v| Cow::Borrowed(v.as_bytes())).into_iter().collect()
        }

        match self {
            Variable::RemoteAddr => facts
                .client_addr
                .map(|addr| Cow::Owned(addr.ip().to_string().into_bytes()))
                .into_iter()
                .collect(),
            Variable::ServerName => text(facts.host.as_deref()),
            Variable::RequestMethod => text(facts.method.as_deref()),
            Variable::RequestUri => text(facts.uri.as_deref()),
            Variable::RequestProtocol => text(facts.protocol.as_deref()),
            Variable::QueryString => text(facts.query_string()),
            Variable::RequestHeaders(None) => facts
                .request_headers
                .iter()
                .map(|(_, v)| Cow::Borrowed(v.as_bytes()))
                .collect(),
            Variable::RequestHeaders(Some(name)) => facts
                .request_header_values(name)
                .map(|v| Cow::Borrowed(v.as_bytes()))
                .collect(),
            Variable::RequestHeadersNames => facts
                .request_headers
                .iter()
                .map(|(n, _)| Cow::Borrowed(n.as_bytes()))
                .collect(),
            Variable::RequestBody => vec![Cow::Borrowed(facts.request_body.bytes())],
            Variable::ResponseStatus => facts
                .response_status
                .map(|status| Cow::Owned(status.to_string().into_bytes()))
                .into_iter()
                .collect(),
            Variable::ResponseHeaders(None) => facts
                .response_headers
                .iter()
                .map(|(_, v)| Cow::Borrowed(v.as_bytes()))
                .collect(),
            Variable::ResponseHeaders(Some(name)) => facts
                .response_header_values(name)
                .map(|v| Cow::Borrowed(v.as_bytes()))
                .collect(),
            Variable::ResponseBody => vec![Cow::Borrowed(facts.response_body.bytes())],
        }
    }
}
