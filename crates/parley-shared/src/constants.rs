/// Maximum automatic reconnection attempts before the transport reports a
/// terminal connection failure.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay between reconnection attempts; the effective delay grows
/// linearly with the attempt number.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Client-side timeout for a message-history fetch.
pub const FETCH_TIMEOUT_MS: u64 = 8_000;

/// Client-side timeout for the DM get-or-create call.
pub const CREATE_DM_TIMEOUT_MS: u64 = 10_000;

/// How long the engine waits for the server to echo a sent message before
/// marking it failed.
pub const SEND_ACK_TIMEOUT_MS: u64 = 10_000;

/// Period of the engine's connection-state reconciliation task.
pub const RECONCILE_INTERVAL_MS: u64 = 1_000;

/// Local retries for a transient fetch failure before it is surfaced.
pub const FETCH_RETRY_LIMIT: u32 = 3;

/// Base delay of the fetch retry backoff; doubles per attempt.
pub const FETCH_RETRY_BASE_DELAY_MS: u64 = 250;

/// Consecutive not-found strikes on the selected conversation before all
/// messaging storage is cleared.
pub const NOT_FOUND_STRIKE_LIMIT: u32 = 3;

/// Capacity of the transport's outbound and inbound channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Default page size when fetching message history.
pub const DEFAULT_MESSAGE_PAGE: u32 = 50;
