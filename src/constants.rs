//! # Constants
//!
//! Defaults and store naming conventions shared by producers and consumers.
//! Both sides of a channel derive their store keys from the same table name,
//! so these suffixes are part of the cross-process contract.

/// Maximum work items extracted per dispatch.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Upper bound on the multiplexer's blocking wait.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1000;

/// Default dispatch priority.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Per-subscriber notification buffer.
pub const DEFAULT_NOTIFICATION_BUFFER_SIZE: usize = 1024;

/// Largest notification payload accepted by producers (pg_notify caps at 8000).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 7800;

/// Hard ceiling for `max_payload_size`.
pub const MAX_PAYLOAD_SIZE_LIMIT: usize = 8000;

/// Seconds a retry item may stay parked before it is reported as stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 300;

/// Separator between table name and key in visible record keys.
pub const DEFAULT_TABLE_SEPARATOR: char = ':';

/// Store key naming
pub mod keys {
    /// Prefix marking a staging record (`_PORT_TABLE:Ethernet0`).
    pub const STAGING_PREFIX: &str = "_";
    /// Pending-key set suffix.
    pub const PENDING_SET_SUFFIX: &str = "_KEY_SET";
    /// Delete-marker set suffix.
    pub const DELETE_SET_SUFFIX: &str = "_DEL_SET";
    /// Wake-up channel suffix.
    pub const CHANNEL_SUFFIX: &str = "_CHANNEL";
    /// Ordered queue list suffix.
    pub const QUEUE_SUFFIX: &str = "_KEY_VALUE_OP_QUEUE";
    /// Channel prefix for per-key change notifications.
    pub const KEYSPACE_PREFIX: &str = "__keyspace__:";
    /// Content-free wake-up token.
    pub const SIGNAL_TOKEN: &str = "G";
}

/// Operation tags carried by keyspace notifications
pub mod keyspace_ops {
    pub const HSET: &str = "hset";
    pub const HDEL: &str = "hdel";
    pub const DEL: &str = "del";
    pub const SADD: &str = "sadd";
    pub const SREM: &str = "srem";
    pub const SPOP: &str = "spop";
    pub const RPUSH: &str = "rpush";
    pub const LPOP: &str = "lpop";
    pub const EXPIRED: &str = "expired";
    pub const EVICTED: &str = "evicted";
}
