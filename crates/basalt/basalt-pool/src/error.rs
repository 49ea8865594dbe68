use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool name '{0}'")]
    InvalidName(String),

    #[error("entries must be a power of two between 2 and {max}, got {entries}")]
    InvalidEntries { entries: u32, max: u32 },

    #[error("bucket count must be between 2 and {max}, got {buckets}")]
    InvalidBuckets { buckets: usize, max: usize },

    #[error("at most {max} notification counters are supported, got {requested}")]
    TooManyNotifications { requested: usize, max: usize },

    #[error("{op} failed for pool '{name}'")]
    Resource {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("pool '{name}' is not attachable (not initialised yet or being destroyed)")]
    NotAttachable { name: String },

    #[error("pool '{name}' layout mismatch: {reason}")]
    Layout { name: String, reason: String },
}

impl PoolError {
    /// True for errors raised before any shared resource was touched.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PoolError::InvalidName(_)
                | PoolError::InvalidEntries { .. }
                | PoolError::InvalidBuckets { .. }
                | PoolError::TooManyNotifications { .. }
        )
    }
}
