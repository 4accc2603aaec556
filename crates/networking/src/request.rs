use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::NetworkError;

/// Common HTTP methods
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    CONNECT,
    TRACE,
    PATCH,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::GET => write!(f, "GET"),
            Method::POST => write!(f, "POST"),
            Method::PUT => write!(f, "PUT"),
            Method::DELETE => write!(f, "DELETE"),
            Method::HEAD => write!(f, "HEAD"),
            Method::OPTIONS => write!(f, "OPTIONS"),
            Method::CONNECT => write!(f, "CONNECT"),
            Method::TRACE => write!(f, "TRACE"),
            Method::PATCH => write!(f, "PATCH"),
        }
    }
}

impl FromStr for Method {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "HEAD" => Ok(Method::HEAD),
            "OPTIONS" => Ok(Method::OPTIONS),
            "CONNECT" => Ok(Method::CONNECT),
            "TRACE" => Ok(Method::TRACE),
            "PATCH" => Ok(Method::PATCH),
            other => Err(NetworkError::ResourceError(format!(
                "Unsupported method: {}",
                other
            ))),
        }
    }
}

/// What the page intends to do with the response (`Sec-Fetch-Dest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Document,
    Style,
    Script,
    Font,
    Image,
    Manifest,
    Worker,
    /// `fetch()` / XHR traffic
    Empty,
    Other,
}

impl Destination {
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" | "iframe" | "frame" => Destination::Document,
            "style" => Destination::Style,
            "script" => Destination::Script,
            "font" => Destination::Font,
            "image" => Destination::Image,
            "manifest" => Destination::Manifest,
            "worker" | "sharedworker" | "serviceworker" => Destination::Worker,
            "" | "empty" => Destination::Empty,
            _ => Destination::Other,
        }
    }

    /// Content type a synthesized fallback for this destination carries.
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Destination::Document => Some("text/html"),
            Destination::Style => Some("text/css"),
            Destination::Script | Destination::Worker => Some("application/javascript"),
            Destination::Font => Some("font/woff2"),
            Destination::Manifest => Some("application/manifest+json"),
            Destination::Image | Destination::Empty | Destination::Other => None,
        }
    }
}

/// Request mode (`Sec-Fetch-Mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    NoCors,
    Cors,
}

impl RequestMode {
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => RequestMode::Navigate,
            "same-origin" => RequestMode::SameOrigin,
            "cors" | "websocket" => RequestMode::Cors,
            _ => RequestMode::NoCors,
        }
    }
}

/// Whether cookies and authorization travel with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Credentials {
    Omit,
    SameOrigin,
    Include,
}

/// An intercepted request
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    method: Method,

    /// Target URL
    url: Url,

    /// Request headers
    headers: HashMap<String, String>,

    /// Request body
    body: Option<Vec<u8>>,

    destination: Destination,
    mode: RequestMode,
    credentials: Credentials,

    /// Request timeout
    timeout: Option<Duration>,
}

impl Request {
    /// Create a new request with the specified method and URL
    pub fn new(method: Method, url: &str) -> Result<Self, NetworkError> {
        let url = Url::parse(url).map_err(NetworkError::UrlError)?;
        Ok(Self::from_url(method, url))
    }

    pub fn from_url(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: None,
            destination: Destination::Empty,
            mode: RequestMode::NoCors,
            credentials: Credentials::SameOrigin,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// A top-level navigation to `url`
    pub fn navigate(url: &str) -> Result<Self, NetworkError> {
        Ok(Self::new(Method::GET, url)?
            .with_destination(Destination::Document)
            .with_mode(RequestMode::Navigate)
            .with_credentials(Credentials::Include))
    }

    /// Set the request body
    pub fn with_body<T: AsRef<[u8]>>(mut self, body: T) -> Self {
        self.body = Some(body.as_ref().to_vec());
        self
    }

    /// Add a header to the request
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// The content type the page expects back.
    ///
    /// Taken from an explicit `Content-Type`, then the first concrete type in
    /// `Accept`, then the destination's default.
    pub fn expected_content_type(&self) -> Option<String> {
        if let Some(ct) = self.header("content-type") {
            return Some(ct.clone());
        }
        if let Some(accept) = self.header("accept") {
            let first = accept
                .split(',')
                .map(|part| part.split(';').next().unwrap_or("").trim())
                .find(|media| !media.is_empty() && !media.contains('*'));
            if let Some(media) = first {
                return Some(media.to_string());
            }
        }
        self.destination.default_content_type().map(str::to_string)
    }

    // Getters

    /// Get the request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get the request URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the request headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Get the request body
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == Destination::Document
    }
}
