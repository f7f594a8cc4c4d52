//! Peruse Events - Stream Consumption and Feed Dispatch
//!
//! The relay consumer, the repository frame codec seam, the feed module
//! contract, the feed registry, and the dispatcher that fans new records out
//! to every feed.

pub mod codec;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod feed;
pub mod registry;

pub use codec::{Block, BlockSet, Frame, JsonFrameCodec, RepoDecoder};
pub use consumer::{ConsumerConfig, ConsumerLoop, StreamEnd};
pub use dispatch::{DispatchReport, EventDispatcher, ModuleFailure, DEFAULT_DISPATCH_CONCURRENCY};
pub use error::{FeedError, RegistryError};
pub use extract::EntityExtractor;
pub use feed::{FeedModule, FeedPage, FeedRequest, SkeletonItem};
pub use registry::{FeedRegistry, FeedRegistryBuilder};
