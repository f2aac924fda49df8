/// Typing indicator time-to-live. A typing signal with no refresh within
/// this window is swept and broadcast as an implicit stop.
pub const TYPING_TTL_SECS: u64 = 5;

/// Interval at which the typing sweep task looks for expired entries.
pub const TYPING_SWEEP_INTERVAL_SECS: u64 = 1;

/// Read receipts for the same (channel, identity) pair arriving within this
/// window collapse to a single broadcast of the latest value.
pub const READ_COALESCE_MS: u64 = 300;

/// Reconnect backoff: first delay.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Reconnect backoff: ceiling.
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Bounded capacity of each connection's outbound event queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Bounded capacity of command channels into long-lived tasks.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Shard count for the presence roster and subscription tables.
pub const TABLE_SHARDS: usize = 16;

/// Maximum message body size in bytes (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Default WebSocket/HTTP listen port for the server binary.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
