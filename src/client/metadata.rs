//! Port for the cloud instance metadata service. The agent performs a
//! single read of the instance id at startup.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("instance metadata unavailable: {0}")]
pub struct MetadataError(pub String);

#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    async fn instance_id(&self) -> Result<String, MetadataError>;
}
