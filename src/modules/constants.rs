use std::time::Duration;

// File system constants
pub const TTL: Duration = Duration::from_secs(1);
pub const BLOCK_SIZE: u64 = 512;
pub const ROOT_INODE: u64 = 1;
pub const INITIAL_INODE: u64 = 2;

/// Default filesystem subtype shown in the mount table.
pub const PROGRAM_NAME: &str = "fusenfs";

/// How long the service loop waits on the client socket before re-checking.
pub const POLL_INTERVAL_MS: i32 = 100;

/// Fewest worker threads started for a multi-threaded mount.
pub const MIN_WORKERS: usize = 2;

// Credential masks used in display-safe connection strings
pub const PASSWORD_KEY: &str = "password";
pub const PASSWORD_MASK: &str = "***";
pub const CREDENTIALS_KEY: &str = "credentials";
pub const CREDENTIALS_MASK: &str = "*filepath*";

// Process exit codes
pub const EXIT_MISSING_CONFIG: i32 = -2;
pub const EXIT_CLIENT_INIT: i32 = -3;
pub const EXIT_PARSE: i32 = -4;
pub const EXIT_MOUNT: i32 = -5;
pub const EXIT_ARGUMENTS: i32 = -6;
pub const EXIT_UNRECOGNIZED_SCHEME: i32 = -7;
pub const EXIT_SESSION: i32 = -8;
