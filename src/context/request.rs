use std::collections::HashMap;

use uuid::Uuid;

/// Tenant id used for cross-tenant and system notifications.
pub const SYSTEM_TENANT: &str = "system";

/// Identity and tracing values for one unit of work.
///
/// Producers build one from the inbound request; consumers rebuild one
/// from envelope metadata before invoking a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    tenant_id: Option<String>,
    user_id: Option<String>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    attributes: HashMap<String, String>,
}

impl RequestContext {
    /// An empty context with no tenant.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    /// Context for work that belongs to no tenant.
    pub fn system() -> Self {
        Self::for_tenant(SYSTEM_TENANT)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: Option<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = span_id;
        self
    }

    /// The tenant id, ignoring blank values.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The correlation id, or a fresh one when the request carried none.
    pub fn correlation_id_or_new(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    pub fn is_system(&self) -> bool {
        self.tenant_id() == Some(SYSTEM_TENANT)
    }

    /// Get a free-form attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    /// Set a free-form attribute.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.tenant_id(), None);
        assert_eq!(ctx.user_id(), None);
        assert!(!ctx.is_system());
    }

    #[test]
    fn blank_tenant_counts_as_missing() {
        let ctx = RequestContext::for_tenant("  ");
        assert_eq!(ctx.tenant_id(), None);
    }

    #[test]
    fn builder_sets_identity_and_trace() {
        let ctx = RequestContext::for_tenant("acme")
            .with_user("user-42")
            .with_correlation_id("corr-1")
            .with_trace("trace-1", Some("span-1".to_string()));

        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert_eq!(ctx.user_id(), Some("user-42"));
        assert_eq!(ctx.correlation_id_or_new(), "corr-1");
        assert_eq!(ctx.trace_id(), Some("trace-1"));
        assert_eq!(ctx.span_id(), Some("span-1"));
    }

    #[test]
    fn missing_correlation_id_is_generated() {
        let ctx = RequestContext::system();
        assert!(ctx.is_system());
        let first = ctx.correlation_id_or_new();
        assert!(!first.is_empty());
        assert_ne!(first, ctx.correlation_id_or_new());
    }

    #[test]
    fn set_and_get_attributes() {
        let mut ctx = RequestContext::new();
        ctx.set("role", "admin");
        assert_eq!(ctx.get("role"), Some("admin"));
        assert_eq!(ctx.attributes().len(), 1);
    }
}
