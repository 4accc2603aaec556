//! Request classification.
//!
//! Every intercepted request is classified exactly once against an ordered
//! table; the first matching route decides how it is handled.

use std::collections::HashSet;
use std::fmt;

use crate::request::{Destination, Request};

/// Browser extension resource schemes
pub const EXTENSION_SCHEMES: &[&str] = &["chrome-extension", "moz-extension", "safari-web-extension"];

/// Real-time relay domains whose handshakes must survive offline periods.
/// Subdomains match as well.
pub const TRUSTED_REALTIME_DOMAINS: &[&str] = &["walletconnect.org", "walletconnect.com", "walletlink.org"];

/// Static assets served stale-while-revalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Style,
    Script,
    Font,
}

impl AssetKind {
    pub fn from_destination(destination: Destination) -> Option<Self> {
        match destination {
            Destination::Style => Some(AssetKind::Style),
            Destination::Script => Some(AssetKind::Script),
            Destination::Font => Some(AssetKind::Font),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AssetKind::Style => "text/css",
            AssetKind::Script => "application/javascript",
            AssetKind::Font => "font/woff2",
        }
    }
}

/// The closed set of request classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    ExtensionResource,
    StaticAsset(AssetKind),
    TrustedRealtime,
    Navigation,
    Precached,
    Other,
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteClass::ExtensionResource => write!(f, "extension"),
            RouteClass::StaticAsset(kind) => write!(f, "static-{:?}", kind),
            RouteClass::TrustedRealtime => write!(f, "trusted-realtime"),
            RouteClass::Navigation => write!(f, "navigation"),
            RouteClass::Precached => write!(f, "precached"),
            RouteClass::Other => write!(f, "other"),
        }
    }
}

type Predicate = Box<dyn Fn(&Request) -> Option<RouteClass> + Send + Sync>;

struct Route {
    name: &'static str,
    predicate: Predicate,
}

/// Outcome of classifying one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
    pub name: &'static str,
    pub class: RouteClass,
}

/// Ordered (name, predicate, class) table; first match wins.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route producing a fixed class when `predicate` holds.
    pub fn route<F>(mut self, name: &'static str, class: RouteClass, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            name,
            predicate: Box::new(move |request| predicate(request).then_some(class)),
        });
        self
    }

    /// Append a route that derives its class from the request.
    pub fn route_with<F>(mut self, name: &'static str, classify: F) -> Self
    where
        F: Fn(&Request) -> Option<RouteClass> + Send + Sync + 'static,
    {
        self.routes.push(Route {
            name,
            predicate: Box::new(classify),
        });
        self
    }

    /// The standard table: extension, navigation, precache, static asset,
    /// trusted realtime. Anything else is `Other`.
    pub fn standard(precached: HashSet<String>, trusted_domains: Vec<String>) -> Self {
        let trusted_domains: Vec<String> = trusted_domains
            .into_iter()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self::new()
            .route("extension-resource", RouteClass::ExtensionResource, is_extension_request)
            .route("navigation", RouteClass::Navigation, Request::is_navigation)
            .route("precache", RouteClass::Precached, move |request| {
                precached.contains(request.url().as_str())
            })
            .route_with("static-asset", |request| {
                AssetKind::from_destination(request.destination()).map(RouteClass::StaticAsset)
            })
            .route("trusted-realtime", RouteClass::TrustedRealtime, move |request| {
                is_trusted_host(request, &trusted_domains)
            })
    }

    pub fn classify(&self, request: &Request) -> RouteMatch {
        self.routes
            .iter()
            .find_map(|route| {
                (route.predicate)(request).map(|class| RouteMatch {
                    name: route.name,
                    class,
                })
            })
            .unwrap_or(RouteMatch {
                name: "default",
                class: RouteClass::Other,
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.routes.iter().map(|r| r.name).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.names())
            .finish()
    }
}

pub fn is_extension_scheme(scheme: &str) -> bool {
    EXTENSION_SCHEMES.contains(&scheme)
}

fn is_extension_request(request: &Request) -> bool {
    is_extension_scheme(request.url().scheme())
}

fn is_trusted_host(request: &Request, trusted_domains: &[String]) -> bool {
    let Some(host) = request.url().host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    trusted_domains.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain.as_str())
                .map(|prefix| prefix.ends_with('.'))
                .unwrap_or(false)
    })
}
