// src/constants.rs

/// Command string that means "read the chain from the `Command` node".
pub const DEFAULT_COMMAND_SENTINEL: &str = "#defaults";

/// Placeholder for "no explicit value, let the external operation decide".
pub const DEFAULT_MARKER: &str = "#";

/// User function prepended to every chain when present.
pub const EVENT_ON_START: &str = "_OnStart";

/// User function appended to every chain when present.
pub const EVENT_ON_EXIT: &str = "_OnExit";

/// Built-in codes whose failure stops the rest of the chain.
pub const CHAIN_CRITICAL_COMMANDS: &[&str] = &["AR", "CM", "CBA", "ABA"];

pub const STATUS_OK: &str = "OK";
pub const STATUS_FAILED: &str = "Failed!";

// --- Configuration document paths ---

pub const XPATH_WORKSPACE: &str = "Application/Workspace/WorkspacePath";
pub const XPATH_GEODATABASE: &str = "Application/Workspace/Geodatabase";
pub const XPATH_MOSAIC_DATASET_NAME: &str = "Application/Workspace/MosaicDataset/Name";
pub const XPATH_REGISTER_RASTER_QUERY: &str =
    "Application/Workspace/MosaicDataset/Processes/RegisterRaster/query";

pub const GEODATABASE_EXT: &str = ".gdb";
pub const SDE_EXT: &str = ".sde";

// --- Parameter folders, relative to the workspace root ---

pub const RASTER_FUNCTION_TEMPLATES_DIR: &str = "Parameter/RasterFunctionTemplates";
pub const RASTER_TYPE_DIR: &str = "Parameter/RasterType";
pub const STATISTICS_DIR: &str = "Parameter/Statistics";
pub const IMPORT_GEOMETRY_DIR: &str = "Parameter";
pub const DEEP_LEARNING_PACKAGES_DIR: &str = "Parameter/DLPKpackages";
pub const ACS_FILES_DIR: &str = "Parameter/ACSFiles";

// --- Lock file polling ---

pub const LOCK_POLL_INTERVAL_SECS: u64 = 3;
pub const LOCK_MAX_WAIT_SECS: u64 = 10;
pub const LOCK_FILE_EXT: &str = ".lock";

/// Depth limit for nested `@` template resolution.
pub const MAX_TEMPLATE_DEPTH: u32 = 32;

/// Prefix of free-form user arguments (`-__name:value`).
pub const USER_ARG_PREFIX: &str = "__";

/// Argument keys whose values are never written to the log.
pub const REDACTED_ARG_KEYS: &[&str] = &["token", "validatingToken"];

pub const TOOLKIT_MANIFEST_FILENAME: &str = "toolkit.toml";
pub const USER_CODE_MANIFEST_FILENAME: &str = "user_code.toml";

/// Name of the project node in the XML run report.
pub const REPORT_PROJECT_NAME: &str = "MDCS";
