//! # Adapter Context
//!
//! Explicitly constructed context shared by controllers and pools. There is
//! no global adapter singleton: everything a controller needs from its
//! surroundings is handed to it here at construction time.

use crate::backend::{ConnectionFactory, Destination, DestinationKind};
use crate::config::ActivationConfig;
use crate::endpoint::EndpointFactory;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// External object-construction collaborator.
///
/// Resolves the backend connection factory and destinations for an
/// activation, whether by name lookup or by provider-specific construction.
/// The mechanics (naming service, class construction, property application)
/// are the collaborator's concern; the adapter only consumes the results.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve_connection_factory(
        &self,
        config: &ActivationConfig,
    ) -> Result<Arc<dyn ConnectionFactory>>;

    async fn resolve_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<Destination>;
}

/// Shared collaborators for one adapter instance, passed by reference to
/// every controller and pool at construction
#[derive(Clone)]
pub struct AdapterContext {
    endpoint_factory: Arc<dyn EndpointFactory>,
    resolver: Arc<dyn DestinationResolver>,
}

impl AdapterContext {
    pub fn new(
        endpoint_factory: Arc<dyn EndpointFactory>,
        resolver: Arc<dyn DestinationResolver>,
    ) -> Self {
        Self {
            endpoint_factory,
            resolver,
        }
    }

    pub fn endpoint_factory(&self) -> &Arc<dyn EndpointFactory> {
        &self.endpoint_factory
    }

    pub fn resolver(&self) -> &Arc<dyn DestinationResolver> {
        &self.resolver
    }
}
