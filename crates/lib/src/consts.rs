//! Names and fixed values shared across the crate.

pub const APP_NAME: &str = "bramble";

/// Environment variable overriding the store root location.
pub const STORE_ROOT_ENV: &str = "BRAMBLE_PATH";

/// Token repeated to pad the store directory out to [`PADDING_TARGET_LEN`].
pub const PADDING_TOKEN: &str = "bramble_store_padding";

/// Length of every store prefix, trailing separator included.
pub const PADDING_TARGET_LEN: usize = 50;

/// Parent used to compute the canonical store prefix that outputs are hashed against.
pub const CANONICAL_STORE_PARENT: &str = "/bramble";

/// Number of hex characters of a SHA-256 digest used in store names and identities.
pub const HASH_PREFIX_LEN: usize = 32;

pub const STORE_LINK_NAME: &str = "store";
pub const TMP_DIR: &str = "tmp";
pub const VAR_DIR: &str = "var";
pub const CONFIG_REGISTRY_DIR: &str = "var/config-registry";
pub const MODULE_CACHE_DIR: &str = "var/star-cache";
pub const STORE_LOCK_FILE: &str = "var/store.lock";

pub const CONFIG_EXTENSION: &str = ".bramble";
pub const DEFAULT_MODULE_FILE: &str = "default.bramble";
pub const PROJECT_FILE: &str = "bramble.toml";
pub const LOCK_FILE: &str = "bramble.lock";

pub const DEFAULT_OUTPUT: &str = "out";
pub const DRV_RECORD_EXTENSION: &str = ".drv";
pub const TEST_FUNCTION_PREFIX: &str = "test_";
