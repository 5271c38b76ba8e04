//! Default constants for geobridge configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default gRPC listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50070";

// =============================================================================
// Feature Store Defaults
// =============================================================================

/// Maximum number of keys per IN-query.
/// The feature service rejects or truncates longer IN-lists.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Chunk queries in flight at once. 1 issues chunks sequentially.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 1;

/// HTTP request timeout against the feature service (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Spatial reference of returned geometries (WGS 84)
pub const DEFAULT_OUT_SR: u32 = 4326;

// =============================================================================
// Column Defaults
// =============================================================================

/// Backend-assigned identity column, shared by both layers
pub const DEFAULT_SURROGATE_KEY_FIELD: &str = "OBJECTID";

pub const ASSET_NATURAL_KEY_FIELD: &str = "BRIDGE_ID";
pub const ASSET_START_FIELD: &str = "START_DATE";
pub const ASSET_END_FIELD: &str = "END_DATE";

pub const ROUTE_NATURAL_KEY_FIELD: &str = "LINKID";
pub const ROUTE_START_FIELD: &str = "FROMDATE";
pub const ROUTE_END_FIELD: &str = "TODATE";

// =============================================================================
// Ingress Defaults
// =============================================================================

/// Capacity of the in-process response channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
