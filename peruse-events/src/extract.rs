//! Named-entity extraction seam used to tag posts before dispatch.

use async_trait::async_trait;
use peruse_core::{Entity, PeruseError};

/// Named-entity extraction over post text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<Entity>, PeruseError>;
}
