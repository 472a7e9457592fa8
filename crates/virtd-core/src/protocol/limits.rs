//! Compiled-in capacity ceilings.
//!
//! Every peer-supplied count or size is compared against one of these values
//! before the decoder allocates storage for it.

/// Largest frame accepted or produced, including the length prefix.
pub const MESSAGE_MAX: usize = 16 * 1024 * 1024;

/// Largest string carried in any payload.
pub const STRING_MAX: usize = 4 * 1024 * 1024;

/// Typed parameter field buffer size, including the terminating NUL that the
/// management API reserves. Names on the wire may use one byte less.
pub const TYPED_PARAM_FIELD_LENGTH: usize = 80;

/// Generic typed parameter list ceiling.
pub const TYPED_PARAM_LIST_MAX: usize = 64;

/// Scheduler parameter list ceiling.
pub const SCHEDULER_PARAMETERS_MAX: usize = 16;

/// Migration parameter list ceiling.
pub const MIGRATE_PARAM_LIST_MAX: usize = 64;

/// Tunable event parameter ceiling.
pub const DOMAIN_EVENT_TUNABLE_MAX: usize = 2048;

/// Per-call CPU statistics: total parameter slots, parameters per CPU and
/// CPUs.
pub const DOMAIN_GET_CPU_STATS_MAX: usize = 2048;
pub const NODE_CPU_STATS_MAX: usize = 16;
pub const DOMAIN_GET_CPU_STATS_NCPUS_MAX: usize = 128;

/// Upper bound on the number of ids returned by a domain enumeration.
pub const DOMAIN_LIST_MAX: usize = 16384;

/// Block and memory peek buffer ceilings.
pub const DOMAIN_BLOCK_PEEK_BUFFER_MAX: usize = 4 * 1024 * 1024;
pub const DOMAIN_MEMORY_PEEK_BUFFER_MAX: usize = 4 * 1024 * 1024;

/// Migration cookie ceiling.
pub const MIGRATE_COOKIE_MAX: usize = 4 * 1024 * 1024;

/// SASL challenge/response payload ceiling.
pub const AUTH_SASL_DATA_MAX: usize = 65536;

/// Number of auth types a server may advertise.
pub const AUTH_TYPE_LIST_MAX: usize = 20;

/// Identities attached to a graphics event subject.
pub const DOMAIN_EVENT_GRAPHICS_IDENTITY_MAX: usize = 20;
