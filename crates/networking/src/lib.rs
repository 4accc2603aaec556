pub mod boundary;
pub mod cache;
pub mod error;
pub mod fetcher;
pub mod interceptor;
pub mod request;
pub mod response;
pub mod routing;

/// Re-export common types for easier usage
pub use boundary::{handle_error, ErrorDisposition, ErrorReport};
pub use cache::{CacheConfig, CacheStorage, ResourceCache};
pub use error::{NetworkError, NetworkResult};
pub use fetcher::{Fetcher, FetcherConfig, HttpFetcher};
pub use interceptor::{InterceptorConfig, LifecycleState, NetworkInterceptor, PrecacheManifest};
pub use request::{Credentials, Destination, Method, Request, RequestMode};
pub use response::{Response, ResponseType};
pub use routing::{AssetKind, RouteClass, RouteMatch, RouteTable};
