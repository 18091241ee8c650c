//! Multi-tenancy strategies.
//!
//! The same strategy instance derives document ids (for routing), tags
//! documents, and builds tenant filters (for purges and queries), so the three
//! always agree.

use crate::error::{Result, SearchBindError};
use crate::types::{DocumentPayload, FieldValue};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

/// Hidden field carrying the tenant id on every document of a multi-tenant
/// index.
pub const TENANT_ID_FIELD: &str = "__tenant_id";

/// Restricts queries and deletes to one or more tenants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantFilter {
    Term { field: String, value: String },
    AnyOf { field: String, values: Vec<String> },
}

impl TenantFilter {
    pub fn field(&self) -> &str {
        match self {
            TenantFilter::Term { field, .. } | TenantFilter::AnyOf { field, .. } => field,
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            TenantFilter::Term { value, .. } => vec![value.as_str()],
            TenantFilter::AnyOf { values, .. } => values.iter().map(String::as_str).collect(),
        }
    }

    pub fn matches(&self, payload: &DocumentPayload) -> bool {
        let Some(tenant) = payload.get(self.field()).and_then(FieldValue::as_text) else {
            return false;
        };
        self.values().contains(&tenant)
    }

    /// Query DSL form understood by HTTP search clusters.
    pub fn to_query_json(&self) -> serde_json::Value {
        match self {
            TenantFilter::Term { field, value } => {
                serde_json::json!({ "term": { field.as_str(): value } })
            }
            TenantFilter::AnyOf { field, values } => {
                serde_json::json!({ "terms": { field.as_str(): values } })
            }
        }
    }
}

pub trait MultiTenancyStrategy: Send + Sync + Debug {
    fn is_multi_tenancy_supported(&self) -> bool;

    /// Fails with a configuration error when the tenant id presence does not
    /// match the strategy. `context` names the caller for the message.
    fn check_tenant_id(&self, tenant_id: Option<&str>, context: &str) -> Result<()>;

    fn check_tenant_ids(&self, tenant_ids: &[String], context: &str) -> Result<()>;

    fn to_document_id(&self, tenant_id: Option<&str>, raw_id: &str) -> String;

    fn contribute_to_document(&self, payload: &mut DocumentPayload, tenant_id: Option<&str>);

    fn filter_or_none(&self, tenant_id: Option<&str>) -> Option<TenantFilter>;

    fn filter_for_tenants(&self, tenant_ids: &[String]) -> Option<TenantFilter>;
}

pub fn strategy_for(multi_tenancy_enabled: bool) -> Arc<dyn MultiTenancyStrategy> {
    if multi_tenancy_enabled {
        Arc::new(DiscriminatorMultiTenancy::default())
    } else {
        Arc::new(NoMultiTenancy)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoMultiTenancy;

impl MultiTenancyStrategy for NoMultiTenancy {
    fn is_multi_tenancy_supported(&self) -> bool {
        false
    }

    fn check_tenant_id(&self, tenant_id: Option<&str>, context: &str) -> Result<()> {
        match tenant_id {
            None => Ok(()),
            Some(tenant) => Err(SearchBindError::config(format!(
                "Tenant id '{}' supplied for {} but multi-tenancy is disabled",
                tenant, context
            ))),
        }
    }

    fn check_tenant_ids(&self, tenant_ids: &[String], context: &str) -> Result<()> {
        if tenant_ids.is_empty() {
            return Ok(());
        }
        Err(SearchBindError::config(format!(
            "Tenant ids {:?} supplied for {} but multi-tenancy is disabled",
            tenant_ids, context
        )))
    }

    fn to_document_id(&self, _tenant_id: Option<&str>, raw_id: &str) -> String {
        raw_id.to_string()
    }

    fn contribute_to_document(&self, _payload: &mut DocumentPayload, _tenant_id: Option<&str>) {}

    fn filter_or_none(&self, _tenant_id: Option<&str>) -> Option<TenantFilter> {
        None
    }

    fn filter_for_tenants(&self, _tenant_ids: &[String]) -> Option<TenantFilter> {
        None
    }
}

/// Shares one index between tenants, told apart by a hidden discriminator
/// field.
#[derive(Debug, Clone)]
pub struct DiscriminatorMultiTenancy {
    field: String,
}

impl Default for DiscriminatorMultiTenancy {
    fn default() -> Self {
        DiscriminatorMultiTenancy {
            field: TENANT_ID_FIELD.to_string(),
        }
    }
}

impl DiscriminatorMultiTenancy {
    pub fn field(&self) -> &str {
        &self.field
    }
}

/// `\` and `_` are escaped so the first unescaped `_` always ends the tenant
/// part: `("a_b", "c")` and `("a", "b_c")` never collide.
fn escape_tenant(tenant: &str) -> String {
    let mut out = String::with_capacity(tenant.len() + 2);
    for ch in tenant.chars() {
        if ch == '\\' || ch == '_' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl MultiTenancyStrategy for DiscriminatorMultiTenancy {
    fn is_multi_tenancy_supported(&self) -> bool {
        true
    }

    fn check_tenant_id(&self, tenant_id: Option<&str>, context: &str) -> Result<()> {
        match tenant_id {
            Some(tenant) if !tenant.is_empty() => Ok(()),
            _ => Err(SearchBindError::config(format!(
                "Multi-tenancy is enabled but no tenant id was supplied for {}",
                context
            ))),
        }
    }

    fn check_tenant_ids(&self, tenant_ids: &[String], context: &str) -> Result<()> {
        if tenant_ids.is_empty() {
            return Err(SearchBindError::config(format!(
                "Multi-tenancy is enabled but an empty tenant set was supplied for {}",
                context
            )));
        }
        for tenant in tenant_ids {
            self.check_tenant_id(Some(tenant), context)?;
        }
        Ok(())
    }

    fn to_document_id(&self, tenant_id: Option<&str>, raw_id: &str) -> String {
        format!("{}_{}", escape_tenant(tenant_id.unwrap_or_default()), raw_id)
    }

    fn contribute_to_document(&self, payload: &mut DocumentPayload, tenant_id: Option<&str>) {
        if let Some(tenant) = tenant_id {
            payload.insert(self.field.clone(), FieldValue::Text(tenant.to_string()));
        }
    }

    fn filter_or_none(&self, tenant_id: Option<&str>) -> Option<TenantFilter> {
        tenant_id.map(|tenant| TenantFilter::Term {
            field: self.field.clone(),
            value: tenant.to_string(),
        })
    }

    fn filter_for_tenants(&self, tenant_ids: &[String]) -> Option<TenantFilter> {
        match tenant_ids {
            [] => None,
            [single] => self.filter_or_none(Some(single)),
            many => Some(TenantFilter::AnyOf {
                field: self.field.clone(),
                values: many.to_vec(),
            }),
        }
    }
}
