use std::collections::HashMap;

use bytes::Bytes;
use url::Url;

use crate::error::NetworkError;
use crate::request::Method;

/// Joins the values of a repeated header. A line feed never occurs inside a
/// header value.
pub const HEADER_VALUE_SEPARATOR: char = '\n';

/// HTTP response status code categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    /// 0 - Opaque cross-origin response
    Opaque,
    /// 1xx - Informational
    Informational,
    /// 2xx - Success
    Success,
    /// 3xx - Redirection
    Redirection,
    /// 4xx - Client Error
    ClientError,
    /// 5xx - Server Error
    ServerError,
    /// Unknown status code
    Unknown,
}

/// How the response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Basic,
    Cors,
    /// Cross-origin no-cors response; status reads as 0
    Opaque,
    /// Built locally as a fallback
    Synthetic,
}

/// HTTP response wrapper
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code
    status: u16,

    status_text: String,

    /// Response headers; a repeated header keeps every value, joined with
    /// [`HEADER_VALUE_SEPARATOR`]
    headers: HashMap<String, String>,

    /// Response body
    body: Bytes,

    /// Final URL after any redirects
    url: Url,

    /// Original request method
    request_method: Method,

    response_type: ResponseType,

    /// Whether the response was from cache
    from_cache: bool,
}

impl Response {
    /// Creates a new Response object
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        body: Bytes,
        url: Url,
        request_method: Method,
    ) -> Self {
        Self {
            status,
            status_text: canonical_reason(status).to_string(),
            headers,
            body,
            url,
            request_method,
            response_type: if status == 0 {
                ResponseType::Opaque
            } else {
                ResponseType::Basic
            },
            from_cache: false,
        }
    }

    /// An empty `200 OK` standing in for a failed fetch.
    pub fn synthetic_ok(url: Url, request_method: Method, content_type: Option<&str>) -> Self {
        let mut headers = HashMap::new();
        if let Some(ct) = content_type {
            headers.insert("Content-Type".to_string(), ct.to_string());
        }
        let mut response = Self::new(200, headers, Bytes::new(), url, request_method);
        response.response_type = ResponseType::Synthetic;
        response
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Same status, status text and body with a replacement header map.
    pub fn with_headers(&self, headers: HashMap<String, String>) -> Self {
        Self {
            headers,
            ..self.clone()
        }
    }

    /// Set whether the response was served from cache
    pub fn set_from_cache(&mut self, from_cache: bool) {
        self.from_cache = from_cache;
    }

    /// Set a header, replacing any existing value regardless of case
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// Add a value to a header, keeping any values it already has
    pub fn append_header(&mut self, name: &str, value: &str) {
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, existing)) => {
                existing.push(HEADER_VALUE_SEPARATOR);
                existing.push_str(value);
            }
            None => {
                self.headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    /// Get the HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Get the HTTP status category
    pub fn status_category(&self) -> StatusCategory {
        match self.status {
            0 => StatusCategory::Opaque,
            100..=199 => StatusCategory::Informational,
            200..=299 => StatusCategory::Success,
            300..=399 => StatusCategory::Redirection,
            400..=499 => StatusCategory::ClientError,
            500..=599 => StatusCategory::ServerError,
            _ => StatusCategory::Unknown,
        }
    }

    /// Check if the response was successful (2xx status code)
    pub fn is_success(&self) -> bool {
        self.status_category() == StatusCategory::Success
    }

    /// Check if the response is an error (4xx or 5xx status code)
    pub fn is_error(&self) -> bool {
        let category = self.status_category();
        category == StatusCategory::ClientError || category == StatusCategory::ServerError
    }

    /// Only opaque (0) and 200 responses are written to a cache
    pub fn is_cacheable(&self) -> bool {
        self.status == 0 || self.status == 200
    }

    /// Get all response headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Every value of a header, in the order received
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.header(name)
            .map(|v| v.split(HEADER_VALUE_SEPARATOR).collect())
            .unwrap_or_default()
    }

    /// Every header as a `(name, value)` pair, repeated headers once per value
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().flat_map(|(name, values)| {
            values
                .split(HEADER_VALUE_SEPARATOR)
                .map(move |value| (name.as_str(), value))
        })
    }

    /// Get the response body as bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the response body as a string
    pub fn body_text(&self) -> Result<String, NetworkError> {
        String::from_utf8(self.body.to_vec()).map_err(|_| {
            NetworkError::ResourceError("Failed to convert response body to string".to_string())
        })
    }

    /// Get the final URL (after any redirects)
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the original request method
    pub fn request_method(&self) -> &Method {
        &self.request_method
    }

    /// Check if the response was served from cache
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Get the content type of the response
    pub fn content_type(&self) -> Option<&String> {
        self.header("content-type")
    }

    /// Check if the response is HTML
    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    /// Check for security headers and return warnings for missing ones
    pub fn security_header_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        // HTTPS-only security headers
        if self.url.scheme() == "https" && self.header("strict-transport-security").is_none() {
            warnings.push("Missing HSTS header".to_string());
        }

        if self.is_html() {
            if self.header("content-security-policy").is_none() {
                warnings.push("Missing Content-Security-Policy header".to_string());
            }

            if self.header("x-content-type-options").is_none() {
                warnings.push("Missing X-Content-Type-Options header".to_string());
            }

            if self.header("x-frame-options").is_none() {
                warnings.push("Missing X-Frame-Options header".to_string());
            }
        }

        warnings
    }
}

fn canonical_reason(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn create_test_response() -> Response {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
        headers.insert("server".to_string(), "test-server".to_string());

        Response::new(
            200,
            headers,
            Bytes::from("<!DOCTYPE html><html><body>Test</body></html>"),
            Url::parse("https://example.com").unwrap(),
            Method::GET,
        )
    }

    #[test]
    fn test_response_status() {
        let response = create_test_response();
        assert_eq!(response.status(), 200);
        assert_eq!(response.status_text(), "OK");
        assert_eq!(response.status_category(), StatusCategory::Success);
        assert!(response.is_success());
        assert!(response.is_cacheable());
    }

    #[test]
    fn test_cacheable_statuses() {
        let url = Url::parse("https://cdn.example.com/a.js").unwrap();
        let opaque = Response::new(0, HashMap::new(), Bytes::new(), url.clone(), Method::GET);
        assert!(opaque.is_cacheable());
        assert_eq!(opaque.response_type(), ResponseType::Opaque);

        let not_found = Response::new(404, HashMap::new(), Bytes::new(), url.clone(), Method::GET);
        assert!(!not_found.is_cacheable());
        assert!(not_found.is_error());

        let partial = Response::new(206, HashMap::new(), Bytes::new(), url, Method::GET);
        assert!(!partial.is_cacheable());
    }

    #[test]
    fn test_set_header_replaces_any_case() {
        let mut response = create_test_response();
        response.set_header("Content-Type", "text/plain");
        assert_eq!(response.headers().len(), 2);
        assert_eq!(response.content_type().unwrap(), "text/plain");
    }

    #[test]
    fn test_repeated_headers_keep_every_value() {
        let mut response = create_test_response();
        response.append_header("Set-Cookie", "session=abc; HttpOnly");
        response.append_header("set-cookie", "theme=dark");

        assert_eq!(
            response.header_values("SET-COOKIE"),
            vec!["session=abc; HttpOnly", "theme=dark"]
        );
        let cookies: Vec<_> = response
            .header_pairs()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, value)| value)
            .collect();
        assert_eq!(cookies, vec!["session=abc; HttpOnly", "theme=dark"]);
        assert_eq!(response.header_values("x-missing"), Vec::<&str>::new());
    }

    #[test]
    fn test_synthetic_response() {
        let url = Url::parse("https://example.com/app.css").unwrap();
        let response = Response::synthetic_ok(url, Method::GET, Some("text/css"));
        assert_eq!(response.status(), 200);
        assert!(response.body().is_empty());
        assert_eq!(response.content_type().unwrap(), "text/css");
        assert_eq!(response.response_type(), ResponseType::Synthetic);
    }

    #[test]
    fn test_security_headers() {
        let response = create_test_response();
        let warnings = response.security_header_warnings();
        assert!(warnings.contains(&"Missing Content-Security-Policy header".to_string()));
    }
}
