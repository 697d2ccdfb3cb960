use model::CfId;
use thiserror::Error;

/// Typed failures callers may want to tell apart.
///
/// Engine operations return `anyhow::Result`; these are attached as the
/// error or as its outermost context, so `err.downcast_ref::<EngineError>()`
/// finds them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown keyspace: {0}")]
    UnknownKeyspace(String),

    #[error("unknown column family: {keyspace}.{name}")]
    UnknownColumnFamily { keyspace: String, name: String },

    /// The durable metadata store rejected a write. Nothing was discarded.
    #[error("failed to persist {what} for column family {cf_id}")]
    MetadataPersist { cf_id: CfId, what: &'static str },

    /// The truncation did not run to completion.
    #[error("truncate of {keyspace}.{name} aborted: {reason}")]
    TruncateAborted {
        keyspace: String,
        name: String,
        reason: String,
    },

    #[error("database is closed")]
    Closed,
}
