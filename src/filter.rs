use regex::bytes::{Regex, RegexBuilder};
use std::collections::HashMap;

use crate::flow::{HTTPFlow, TCPFlow};
use crate::http::{Message, Request, Response};
use crate::{Error, Result};

/// A flow as seen by filter expressions.
#[derive(Debug, Clone, Copy)]
pub enum FlowRef<'a> {
    Http(&'a HTTPFlow),
    Tcp(&'a TCPFlow),
}

impl<'a> From<&'a HTTPFlow> for FlowRef<'a> {
    fn from(flow: &'a HTTPFlow) -> Self {
        FlowRef::Http(flow)
    }
}

impl<'a> From<&'a TCPFlow> for FlowRef<'a> {
    fn from(flow: &'a TCPFlow) -> Self {
        FlowRef::Tcp(flow)
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub expression: String,
    pub compiled: CompiledFilter,
}

#[derive(Debug, Clone)]
pub enum CompiledFilter {
    Always,
    Method(Regex),
    Domain(Regex),
    Path(Regex),
    Url(Regex),
    Body(Regex),
    RequestBody(Regex),
    ResponseBody(Regex),
    Header(Regex),
    RequestHeader(Regex),
    ResponseHeader(Regex),
    StatusCode(u16),
    ContentType(Regex),
    Request,
    Response,
    Error,
    Marked,
    Http,
    Tcp,
    And(Box<CompiledFilter>, Box<CompiledFilter>),
    Or(Box<CompiledFilter>, Box<CompiledFilter>),
    Not(Box<CompiledFilter>),
}

impl Filter {
    pub fn new(expression: &str) -> Result<Self> {
        let compiled = Self::compile(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            compiled,
        })
    }

    pub fn matches<'a>(&self, flow: impl Into<FlowRef<'a>>) -> bool {
        self.compiled.matches(flow.into())
    }

    fn compile(expr: &str) -> Result<CompiledFilter> {
        let expr = expr.trim();

        if expr.is_empty() {
            return Err(Error::filter("empty filter expression"));
        }

        if let Some(or_pos) = find_operator(expr, '|') {
            let left = Self::compile(&expr[..or_pos])?;
            let right = Self::compile(&expr[or_pos + 1..])?;
            return Ok(CompiledFilter::Or(Box::new(left), Box::new(right)));
        }

        if let Some(and_pos) = find_operator(expr, '&') {
            let left = Self::compile(&expr[..and_pos])?;
            let right = Self::compile(&expr[and_pos + 1..])?;
            return Ok(CompiledFilter::And(Box::new(left), Box::new(right)));
        }

        if let Some(inner) = expr.strip_prefix('!') {
            let inner = Self::compile(inner)?;
            return Ok(CompiledFilter::Not(Box::new(inner)));
        }

        if expr.starts_with('(') {
            if !expr.ends_with(')') {
                return Err(Error::filter(format!("unbalanced parentheses in {:?}", expr)));
            }
            return Self::compile(&expr[1..expr.len() - 1]);
        }

        let (token, arg) = match expr.split_once(char::is_whitespace) {
            Some((token, arg)) => (token, Some(unquote(arg.trim()))),
            None => (expr, None),
        };

        let filter = match (token, arg.as_deref()) {
            ("~all", None) => CompiledFilter::Always,
            ("~q", None) => CompiledFilter::Request,
            ("~s", None) => CompiledFilter::Response,
            ("~e", None) => CompiledFilter::Error,
            ("~marked", None) => CompiledFilter::Marked,
            ("~http", None) => CompiledFilter::Http,
            ("~tcp", None) => CompiledFilter::Tcp,
            ("~m", Some(arg)) => CompiledFilter::Method(pattern(arg)?),
            ("~d", Some(arg)) => CompiledFilter::Domain(pattern(arg)?),
            ("~p", Some(arg)) => CompiledFilter::Path(pattern(arg)?),
            ("~u", Some(arg)) => CompiledFilter::Url(pattern(arg)?),
            ("~b", Some(arg)) => CompiledFilter::Body(pattern(arg)?),
            ("~bq", Some(arg)) => CompiledFilter::RequestBody(pattern(arg)?),
            ("~bs", Some(arg)) => CompiledFilter::ResponseBody(pattern(arg)?),
            ("~h", Some(arg)) => CompiledFilter::Header(pattern(arg)?),
            ("~hq", Some(arg)) => CompiledFilter::RequestHeader(pattern(arg)?),
            ("~hs", Some(arg)) => CompiledFilter::ResponseHeader(pattern(arg)?),
            ("~t", Some(arg)) => CompiledFilter::ContentType(pattern(arg)?),
            ("~c", Some(arg)) => {
                let code = arg
                    .parse::<u16>()
                    .map_err(|_| Error::filter(format!("invalid status code: {}", arg)))?;
                CompiledFilter::StatusCode(code)
            }
            (token, _) if token.starts_with('~') => {
                return Err(Error::filter(format!("invalid filter expression: {}", expr)))
            }
            // A bare pattern matches the URL.
            _ => CompiledFilter::Url(pattern(&unquote(expr))?),
        };
        Ok(filter)
    }
}

fn pattern(arg: &str) -> Result<Regex> {
    RegexBuilder::new(arg)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::filter(format!("Invalid regex: {}", e)))
}

fn unquote(arg: &str) -> String {
    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return arg[1..arg.len() - 1].to_string();
        }
    }
    arg.to_string()
}

fn headers_match(regex: &Regex, message: &dyn Message) -> bool {
    message
        .headers()
        .iter()
        .any(|(name, value)| regex.is_match(&[name, b": ", value].concat()))
}

fn body_match(regex: &Regex, message: &dyn Message) -> bool {
    match message.get_decoded_content(None) {
        Ok(Some(content)) => regex.is_match(&content),
        Ok(None) => false,
        Err(_) => message.content().map_or(false, |raw| regex.is_match(raw)),
    }
}

fn content_type_match(regex: &Regex, message: &dyn Message) -> bool {
    message
        .headers()
        .get("content-type")
        .map_or(false, |ct| regex.is_match(ct.as_bytes()))
}

fn request(flow: FlowRef<'_>) -> Option<&Request> {
    match flow {
        FlowRef::Http(f) => Some(&f.request),
        FlowRef::Tcp(_) => None,
    }
}

fn response(flow: FlowRef<'_>) -> Option<&Response> {
    match flow {
        FlowRef::Http(f) => f.response.as_ref(),
        FlowRef::Tcp(_) => None,
    }
}

impl CompiledFilter {
    pub fn matches(&self, flow: FlowRef<'_>) -> bool {
        match self {
            CompiledFilter::Always => true,

            CompiledFilter::Method(regex) => {
                request(flow).map_or(false, |r| regex.is_match(r.method.as_bytes()))
            }

            CompiledFilter::Domain(regex) => request(flow)
                .and_then(|r| r.pretty_host())
                .map_or(false, |host| regex.is_match(host.as_bytes())),

            CompiledFilter::Path(regex) => request(flow)
                .and_then(|r| r.path.as_deref())
                .map_or(false, |path| regex.is_match(path.as_bytes())),

            CompiledFilter::Url(regex) => {
                request(flow).map_or(false, |r| regex.is_match(r.url().as_bytes()))
            }

            CompiledFilter::Body(regex) => match flow {
                FlowRef::Http(f) => {
                    body_match(regex, &f.request)
                        || f.response.as_ref().map_or(false, |r| body_match(regex, r))
                }
                FlowRef::Tcp(f) => f.messages.iter().any(|m| regex.is_match(&m.content)),
            },

            CompiledFilter::RequestBody(regex) => match flow {
                FlowRef::Http(f) => body_match(regex, &f.request),
                FlowRef::Tcp(f) => f
                    .messages
                    .iter()
                    .any(|m| m.from_client && regex.is_match(&m.content)),
            },

            CompiledFilter::ResponseBody(regex) => match flow {
                FlowRef::Http(f) => f.response.as_ref().map_or(false, |r| body_match(regex, r)),
                FlowRef::Tcp(f) => f
                    .messages
                    .iter()
                    .any(|m| !m.from_client && regex.is_match(&m.content)),
            },

            CompiledFilter::Header(regex) => {
                request(flow).map_or(false, |r| headers_match(regex, r))
                    || response(flow).map_or(false, |r| headers_match(regex, r))
            }

            CompiledFilter::RequestHeader(regex) => {
                request(flow).map_or(false, |r| headers_match(regex, r))
            }

            CompiledFilter::ResponseHeader(regex) => {
                response(flow).map_or(false, |r| headers_match(regex, r))
            }

            CompiledFilter::StatusCode(code) => {
                response(flow).map_or(false, |r| r.status_code == *code)
            }

            CompiledFilter::ContentType(regex) => {
                request(flow).map_or(false, |r| content_type_match(regex, r))
                    || response(flow).map_or(false, |r| content_type_match(regex, r))
            }

            CompiledFilter::Request => {
                matches!(flow, FlowRef::Http(_)) && response(flow).is_none()
            }

            CompiledFilter::Response => response(flow).is_some(),

            CompiledFilter::Error => match flow {
                FlowRef::Http(f) => f.flow.error.is_some(),
                FlowRef::Tcp(f) => f.flow.error.is_some(),
            },

            CompiledFilter::Marked => match flow {
                FlowRef::Http(f) => !f.flow.marked.is_empty(),
                FlowRef::Tcp(f) => !f.flow.marked.is_empty(),
            },

            CompiledFilter::Http => matches!(flow, FlowRef::Http(_)),
            CompiledFilter::Tcp => matches!(flow, FlowRef::Tcp(_)),

            CompiledFilter::And(left, right) => left.matches(flow) && right.matches(flow),

            CompiledFilter::Or(left, right) => left.matches(flow) || right.matches(flow),

            CompiledFilter::Not(inner) => !inner.matches(flow),
        }
    }
}

// Top-level operator position, outside parentheses and quotes.
fn find_operator(expr: &str, op: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for (i, ch) in expr.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, c) if c == op && depth == 0 => return Some(i),
            _ => {}
        }
    }

    None
}

pub fn get_filter_help() -> HashMap<&'static str, &'static str> {
    let mut help = HashMap::new();

    help.insert("~all", "All flows");
    help.insert("~b", "Body");
    help.insert("~bq", "Body request");
    help.insert("~bs", "Body response");
    help.insert("~c", "Code");
    help.insert("~d", "Domain");
    help.insert("~e", "Error");
    help.insert("~h", "Header");
    help.insert("~hq", "Header request");
    help.insert("~hs", "Header response");
    help.insert("~http", "HTTP flow");
    help.insert("~m", "Method");
    help.insert("~marked", "Marked flow");
    help.insert("~p", "Path");
    help.insert("~q", "Request with no response");
    help.insert("~s", "Response");
    help.insert("~t", "Content-type");
    help.insert("~tcp", "TCP flow");
    help.insert("~u", "URL");
    help.insert("!", "Unary not");
    help.insert("&", "And");
    help.insert("|", "Or");
    help.insert("(...)", "Grouping");

    help
}
