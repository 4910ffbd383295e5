/// Maximum chat message length, in characters, after trimming
pub const MAX_CHAT_MESSAGE_CHARS: usize = 2000;

/// Maximum forum thread title length in characters
pub const MAX_THREAD_TITLE_CHARS: usize = 128;

/// Maximum forum thread body length in characters
pub const MAX_THREAD_BODY_CHARS: usize = 100_000;

/// Maximum forum reply length in characters
pub const MAX_REPLY_CHARS: usize = 5000;

/// Default and maximum page size for chat history
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 100;

/// Seconds without activity before a user is considered offline
pub const DEFAULT_ONLINE_TIMEOUT_SECS: u64 = 30;

/// Minimum gap between two sends from one user before a challenge is issued
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 725;

/// Lifetime of an unsolved challenge
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 300;

/// The reserved administrator account that can never be deleted
pub const RESERVED_ADMIN_ID: i64 = 1;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
