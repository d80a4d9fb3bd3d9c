use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// A tenant-scoped envelope was requested without a tenant in context.
    #[error("no tenant in request context")]
    MissingTenant,
    #[error("envelope field `{0}` must not be empty")]
    MissingField(&'static str),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),
}
