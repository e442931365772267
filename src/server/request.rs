use crate::packet::Sid;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Options,
    Other,
}

impl Method {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "OPTIONS" => Method::Options,
            _ => Method::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
            Method::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// The parts of an inbound HTTP request the engine looks at.
///
/// Parsing the raw request belongs to the HTTP layer; it hands over the
/// method and the decoded query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub query: HashMap<String, String>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: HashMap::new(),
        }
    }

    /// Builds a request from a path with an already-decoded query string,
    /// e.g. `/engine?transport=polling-xhr&sid=abc`.
    pub fn from_url(method: Method, url: &str) -> Self {
        let mut request = Self::new(method);
        if let Some((_, query)) = url.split_once('?') {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                request.query.insert(key.to_string(), value.to_string());
            }
        }
        request
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn transport(&self) -> Option<&str> {
        self.query.get("transport").map(String::as_str)
    }

    /// The session id, treating an empty value as absent.
    pub fn sid(&self) -> Option<Sid> {
        self.query
            .get("sid")
            .filter(|sid| !sid.is_empty())
            .map(|sid| Sid::from(sid.as_str()))
    }
}
