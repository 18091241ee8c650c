//! Document identity and routing resolution.
//!
//! A sharded backend must see the same routing key on delete as on the write
//! that created the document. When the routing-relevant state of an entity
//! can change, bridges report every route the document could have been
//! written to (`previous routes`) so deletes can be broadcast to all of them.

use crate::error::{Result, SearchBindError};
use crate::tenancy::MultiTenancyStrategy;
use crate::types::{json_value_to_field_value, DocumentId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Routes collected by a [`RoutingBridge`] for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRoutes {
    current: Vec<Option<String>>,
    not_indexed: bool,
    previous: BTreeSet<String>,
}

impl DocumentRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the document with `routing_key`.
    pub fn add_route(&mut self, routing_key: impl Into<String>) -> &mut Self {
        self.current.push(Some(routing_key.into()));
        self
    }

    /// Route the document without a routing key (backend default routing).
    pub fn add_default_route(&mut self) -> &mut Self {
        self.current.push(None);
        self
    }

    /// The entity must not be present in the index in its current state.
    pub fn not_indexed(&mut self) -> &mut Self {
        self.not_indexed = true;
        self
    }

    pub fn add_previous_route(&mut self, routing_key: impl Into<String>) -> &mut Self {
        self.previous.insert(routing_key.into());
        self
    }

    pub fn is_not_indexed(&self) -> bool {
        self.not_indexed
    }

    pub fn previous(&self) -> &BTreeSet<String> {
        &self.previous
    }
}

pub trait RoutingBridge: Send + Sync {
    /// Compute the route for the entity's current state.
    fn route(&self, routes: &mut DocumentRoutes, raw_id: &str, state: &serde_json::Value)
        -> Result<()>;

    /// Report every route the entity may have been written to in the past.
    /// The default assumes routes never change.
    fn previous_routes(
        &self,
        routes: &mut DocumentRoutes,
        raw_id: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        let mut current = DocumentRoutes::new();
        self.route(&mut current, raw_id, state)?;
        for key in current.current.into_iter().flatten() {
            routes.add_previous_route(key);
        }
        Ok(())
    }
}

/// Routes by the value of one field of the entity state (dotted paths reach
/// into nested objects).
#[derive(Debug, Clone)]
pub struct FieldRoutingBridge {
    path: String,
    required: bool,
    possible_values: BTreeSet<String>,
    excluded_values: BTreeSet<String>,
}

impl FieldRoutingBridge {
    pub fn new(path: impl Into<String>) -> Self {
        FieldRoutingBridge {
            path: path.into(),
            required: true,
            possible_values: BTreeSet::new(),
            excluded_values: BTreeSet::new(),
        }
    }

    /// A missing value routes to the default route instead of failing.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// The closed set of values the field can take. Deletes are broadcast to
    /// all of them because the value at write time is unknown.
    pub fn with_possible_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.possible_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Entities whose field holds one of these values are kept out of the
    /// index.
    pub fn excluding<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_values = values.into_iter().map(Into::into).collect();
        self
    }

    fn lookup(&self, state: &serde_json::Value) -> Option<String> {
        let mut node = state;
        for segment in self.path.split('.') {
            node = node.get(segment)?;
        }
        json_value_to_field_value(node).and_then(|v| v.to_key_string())
    }
}

impl RoutingBridge for FieldRoutingBridge {
    fn route(
        &self,
        routes: &mut DocumentRoutes,
        raw_id: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        match self.lookup(state) {
            Some(value) if self.excluded_values.contains(&value) => {
                routes.not_indexed();
            }
            Some(value) => {
                routes.add_route(value);
            }
            None if self.required => {
                return Err(SearchBindError::RoutingResolution {
                    entity_type: String::new(),
                    id: raw_id.to_string(),
                    reason: format!("routing field '{}' is missing or not a scalar", self.path),
                });
            }
            None => {
                routes.add_default_route();
            }
        }
        Ok(())
    }

    fn previous_routes(
        &self,
        routes: &mut DocumentRoutes,
        _raw_id: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        if self.possible_values.is_empty() {
            if let Some(value) = self.lookup(state) {
                routes.add_previous_route(value);
            }
        } else {
            for value in &self.possible_values {
                routes.add_previous_route(value.clone());
            }
        }
        Ok(())
    }
}

/// Fully resolved identity of one entity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub document_id: DocumentId,
    pub routing_key: Option<String>,
    pub previous_routing_keys: BTreeSet<String>,
    /// False when the routing bridge excluded the entity from the index.
    pub indexed: bool,
}

#[derive(Clone)]
pub struct RoutingResolver {
    entity_type: String,
    tenancy: Arc<dyn MultiTenancyStrategy>,
    bridge: Option<Arc<dyn RoutingBridge>>,
}

impl fmt::Debug for RoutingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingResolver")
            .field("entity_type", &self.entity_type)
            .field("tenancy", &self.tenancy)
            .field("routed", &self.bridge.is_some())
            .finish()
    }
}

impl RoutingResolver {
    pub fn new(
        entity_type: impl Into<String>,
        tenancy: Arc<dyn MultiTenancyStrategy>,
        bridge: Option<Arc<dyn RoutingBridge>>,
    ) -> Self {
        RoutingResolver {
            entity_type: entity_type.into(),
            tenancy,
            bridge,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn tenancy(&self) -> &Arc<dyn MultiTenancyStrategy> {
        &self.tenancy
    }

    /// Tenant-scoped document id. Needs no entity state, so plans key their
    /// slots with it as soon as an event arrives.
    pub fn document_id(&self, tenant_id: Option<&str>, raw_id: &str) -> Result<DocumentId> {
        self.tenancy.check_tenant_id(
            tenant_id,
            &format!("{}#{}", self.entity_type, raw_id),
        )?;
        Ok(self.tenancy.to_document_id(tenant_id, raw_id))
    }

    /// Current and previous routes for an entity state.
    pub fn routes(&self, raw_id: &str, state: &serde_json::Value) -> Result<DocumentRoutes> {
        let mut routes = DocumentRoutes::new();
        let Some(bridge) = self.bridge.as_ref() else {
            routes.add_default_route();
            return Ok(routes);
        };

        bridge
            .route(&mut routes, raw_id, state)
            .and_then(|_| bridge.previous_routes(&mut routes, raw_id, state))
            .map_err(|e| self.attach_entity_type(e))?;

        if routes.current.len() > 1 {
            return Err(SearchBindError::RoutingResolution {
                entity_type: self.entity_type.clone(),
                id: raw_id.to_string(),
                reason: format!("{} current routes defined, expected one", routes.current.len()),
            });
        }
        if routes.current.is_empty() && !routes.not_indexed {
            return Err(SearchBindError::RoutingResolution {
                entity_type: self.entity_type.clone(),
                id: raw_id.to_string(),
                reason: "routing bridge defined no route".to_string(),
            });
        }
        Ok(routes)
    }

    pub fn resolve(
        &self,
        tenant_id: Option<&str>,
        raw_id: &str,
        state: &serde_json::Value,
    ) -> Result<ResolvedIdentity> {
        let document_id = self.document_id(tenant_id, raw_id)?;
        let routes = self.routes(raw_id, state)?;
        let indexed = !routes.not_indexed;
        let routing_key = if indexed {
            routes.current.into_iter().next().flatten()
        } else {
            None
        };
        Ok(ResolvedIdentity {
            document_id,
            routing_key,
            previous_routing_keys: routes.previous,
            indexed,
        })
    }

    /// Identity for a delete. `state` is `None` when the caller only knows the
    /// id; the delete then goes to every previous route the bridge can name
    /// without state, and fails if a routing bridge exists but names none.
    pub fn resolve_for_delete(
        &self,
        tenant_id: Option<&str>,
        raw_id: &str,
        state: Option<&serde_json::Value>,
    ) -> Result<ResolvedIdentity> {
        let document_id = self.document_id(tenant_id, raw_id)?;
        let Some(bridge) = self.bridge.as_ref() else {
            return Ok(ResolvedIdentity {
                document_id,
                routing_key: None,
                previous_routing_keys: BTreeSet::new(),
                indexed: true,
            });
        };

        if let Some(state) = state {
            let resolved = self.resolve(tenant_id, raw_id, state)?;
            return Ok(ResolvedIdentity {
                indexed: true,
                ..resolved
            });
        }

        let mut routes = DocumentRoutes::new();
        bridge
            .previous_routes(&mut routes, raw_id, &serde_json::Value::Null)
            .map_err(|e| self.attach_entity_type(e))?;
        if routes.previous.is_empty() {
            return Err(SearchBindError::RoutingResolution {
                entity_type: self.entity_type.clone(),
                id: raw_id.to_string(),
                reason: "no entity state and no known routes to delete from".to_string(),
            });
        }
        Ok(ResolvedIdentity {
            document_id,
            routing_key: None,
            previous_routing_keys: routes.previous,
            indexed: true,
        })
    }

    fn attach_entity_type(&self, error: SearchBindError) -> SearchBindError {
        match error {
            SearchBindError::RoutingResolution { id, reason, .. } => {
                SearchBindError::RoutingResolution {
                    entity_type: self.entity_type.clone(),
                    id,
                    reason,
                }
            }
            other => other,
        }
    }
}
