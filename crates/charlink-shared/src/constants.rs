/// Application name
pub const APP_NAME: &str = "Charlink";

/// Number of most recent messages fed into a prompt by default
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Default page size for the character feed
pub const DEFAULT_FEED_LIMIT: usize = 20;

/// Page size for category / name searches
pub const SEARCH_LIMIT: usize = 50;

/// Maximum message text size in bytes (16 KiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Maximum avatar upload size in bytes (10 MiB)
pub const MAX_AVATAR_SIZE: usize = 10 * 1024 * 1024;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Feed tab labels with a dedicated ordering
pub const FEED_ALL: &str = "All";
pub const FEED_NEW: &str = "New";
pub const FEED_TRENDING: &str = "Trending";
pub const FEED_POPULAR: &str = "Popular";
