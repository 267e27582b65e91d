use std::net::IpAddr;

pub mod config;
pub mod notifier;
pub mod resolver;
pub mod server;

use crate::resolver::{ExternalIpResolver, ResolutionFailure};
use async_trait::async_trait;

/// Something that can tell the machine's external IP address.
#[async_trait]
pub trait IpSource: Send + Sync {
    async fn resolve(&self) -> Result<IpAddr, ResolutionFailure>;
}

#[async_trait]
impl IpSource for ExternalIpResolver {
    async fn resolve(&self) -> Result<IpAddr, ResolutionFailure> {
        self.resolve().await
    }
}
