//! Access log formatting.
//!
//! A format is a template with `:name` placeholders, compiled once at
//! startup:
//!
//! ```text
//! :Xip - :userID [:endDate] ":method :url :protocol/:httpVersion" :statusCode :contentLength ":referer" ":userAgent"
//! ```
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `:ip` | peer address |
//! | `:Xip` | first `X-Forwarded-For` entry, else peer address |
//! | `:userID` | authenticated user (always `-`, there is no auth) |
//! | `:startDate`, `:endDate` | `%d/%b/%Y:%H:%M:%S %z` |
//! | `:method`, `:url` | request line |
//! | `:protocol`, `:httpVersion` | `HTTP`, `1.1` |
//! | `:statusCode` | response status |
//! | `:contentLength` | body bytes actually sent |
//! | `:referer`, `:userAgent` | request headers |
//! | `:delta` | milliseconds from start to end |
//!
//! Unknown placeholders are kept verbatim; missing values print as `-`.

use axum::http::{header, HeaderMap, Method, StatusCode, Uri, Version};
use chrono::{DateTime, Local};
use std::net::SocketAddr;

const DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Ip,
    Xip,
    UserId,
    StartDate,
    EndDate,
    Method,
    Url,
    Protocol,
    HttpVersion,
    StatusCode,
    ContentLength,
    Referer,
    UserAgent,
    Delta,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ip" => Field::Ip,
            "Xip" => Field::Xip,
            "userID" => Field::UserId,
            "startDate" => Field::StartDate,
            "endDate" => Field::EndDate,
            "method" => Field::Method,
            "url" => Field::Url,
            "protocol" => Field::Protocol,
            "httpVersion" => Field::HttpVersion,
            "statusCode" => Field::StatusCode,
            "contentLength" => Field::ContentLength,
            "referer" => Field::Referer,
            "userAgent" => Field::UserAgent,
            "delta" => Field::Delta,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field(Field),
}

/// A compiled access log template.
#[derive(Debug, Clone)]
pub struct AccessLogFormat {
    tokens: Vec<Token>,
}

impl AccessLogFormat {
    pub fn parse(template: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(pos) = rest.find(':') {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let name_len = after
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(after.len());

            match Field::from_name(&after[..name_len]) {
                Some(field) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Field(field));
                }
                None => {
                    literal.push(':');
                    literal.push_str(&after[..name_len]);
                }
            }
            rest = &after[name_len..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self { tokens }
    }

    /// Renders one log line.
    pub fn format(&self, entry: &AccessEntry) -> String {
        let mut line = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => line.push_str(text),
                Token::Field(field) => line.push_str(&entry.value(*field)),
            }
        }
        line
    }
}

/// Request side of an access log entry, captured when the request arrives.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub peer: Option<SocketAddr>,
    pub forwarded_for: Option<String>,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub started: DateTime<Local>,
}

impl RequestInfo {
    pub fn new(
        peer: Option<SocketAddr>,
        method: &Method,
        uri: &Uri,
        version: Version,
        headers: &HeaderMap,
    ) -> Self {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            peer,
            forwarded_for: text(header::HeaderName::from_static("x-forwarded-for")),
            method: method.clone(),
            uri: uri.clone(),
            version,
            referer: text(header::REFERER),
            user_agent: text(header::USER_AGENT),
            started: Local::now(),
        }
    }

    /// Completes the entry once the response outcome is known.
    pub fn finish(self, status: StatusCode, content_length: u64) -> AccessEntry {
        AccessEntry {
            request: self,
            status,
            content_length,
            finished: Local::now(),
        }
    }
}

/// A finished request/response pair.
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub request: RequestInfo,
    pub status: StatusCode,
    pub content_length: u64,
    pub finished: DateTime<Local>,
}

impl AccessEntry {
    fn value(&self, field: Field) -> String {
        let req = &self.request;
        let or_dash = |v: Option<&str>| v.filter(|s| !s.is_empty()).unwrap_or("-").to_string();

        match field {
            Field::Ip => or_dash(req.peer.map(|p| p.ip().to_string()).as_deref()),
            Field::Xip => {
                let forwarded = req
                    .forwarded_for
                    .as_deref()
                    .and_then(|v| v.split(',').next())
                    .map(str::trim);
                match forwarded.filter(|s| !s.is_empty()) {
                    Some(ip) => ip.to_string(),
                    None => self.value(Field::Ip),
                }
            }
            Field::UserId => "-".to_string(),
            Field::StartDate => req.started.format(DATE_FORMAT).to_string(),
            Field::EndDate => self.finished.format(DATE_FORMAT).to_string(),
            Field::Method => req.method.to_string(),
            Field::Url => req.uri.to_string(),
            Field::Protocol => "HTTP".to_string(),
            Field::HttpVersion => http_version(req.version).to_string(),
            Field::StatusCode => self.status.as_u16().to_string(),
            Field::ContentLength => self.content_length.to_string(),
            Field::Referer => or_dash(req.referer.as_deref()),
            Field::UserAgent => or_dash(req.user_agent.as_deref()),
            Field::Delta => (self.finished - req.started).num_milliseconds().to_string(),
        }
    }
}

fn http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "-",
    }
}

/// Escapes line breaks so a query never spans several log lines.
/// `\r\n`, `\n` and `\r` each become the two characters `\n`.
pub fn escape_query(query: &str) -> String {
    query
        .replace("\r\n", "\\n")
        .replace(['\n', '\r'], "\\n")
}
