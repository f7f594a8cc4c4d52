//! Peruse API - Feed Generator Service
//!
//! Serves feed skeletons to AT Protocol app views. Requests for
//! identity-scoped feeds are authenticated against the caller's published
//! signing key; feed modules answer from expiring caches over the analytical
//! store.

pub mod auth;
pub mod config;
pub mod error;
pub mod extractor;
pub mod feeds;
pub mod identity;
pub mod macros;
pub mod routes;
pub mod sql;
pub mod state;
pub mod telemetry;
pub mod users;

pub use auth::{AlgorithmTable, AuthConfig, AuthError, AuthVerifier, SignatureScheme};
pub use config::{LogFormat, ServerConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use extractor::{NervanaClient, NervanaConfig};
pub use feeds::{CloseByFeed, SuggestedFollowsFeed, TopicEntity, TopicFeed, TopicFeedConfig};
pub use identity::{DirectoryConfig, PlcDirectory};
pub use routes::create_router;
pub use state::{AppState, ServiceInfo};
pub use users::{UserManager, UserSession};
