// -
// Mesh database key space

/// Registry root every mesh key lives under
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Singleton mesh-wide settings
pub const MESH_STATE_PREFIX: &str = "/registry/meshstate/";
pub const IPV6_PREFIX_KEY: &str = "/registry/meshstate/ipv6prefix";
pub const IPV4_PREFIX_KEY: &str = "/registry/meshstate/ipv4prefix";
pub const MESH_DOMAIN_KEY: &str = "/registry/meshstate/meshdomain";

/// Peer records, keyed by node id
pub const PEERS_PREFIX: &str = "/registry/peers/";

/// Network ACLs, keyed by name
pub const NETWORK_ACLS_PREFIX: &str = "/registry/network-acls/";

// -
// Storage engine namespaces

/// Engine tree namespaces
pub(crate) const STATE_MACHINE_TREE: &str = "_state_machine_tree";
pub(crate) const STATE_MACHINE_META_TREE: &str = "_state_machine_metadata";
pub(crate) const RAFT_LOG_TREE: &str = "_raft_log";
pub(crate) const RAFT_STATE_TREE: &str = "_raft_state";

/// Engine entry keys
pub(crate) const STATE_MACHINE_META_KEY_LAST_APPLIED: &str = "_raft_last_applied";
pub(crate) const STATE_STORAGE_HARD_STATE_KEY: &str = "_state_storage_hard_state";
pub(crate) const LAST_SNAPSHOT_KEY: &str = "_raft_last_snapshot";

// -
// Services

/// Metadata key carrying the identity a forwarded request was proxied for
pub const PROXIED_FOR_METADATA_KEY: &str = "x-mesh-proxied-for";

/// Wildcard accepted in ACL node lists and RBAC grants
pub const WILDCARD: &str = "*";

/// Default mesh domain written at bootstrap
pub const DEFAULT_MESH_DOMAIN: &str = "webmesh.internal";

/// Default IPv4 network written at bootstrap
pub const DEFAULT_IPV4_PREFIX: &str = "172.16.0.0/12";

// -
// IPAM

/// Random /64 subnet attempts before an IPv6 allocation gives up
pub const IPV6_ALLOCATION_MAX_TRIES: usize = 100;

/// File under `data_dir` holding a generated node id
pub const NODE_ID_FILE: &str = "node-id";

/// Name of the built-in IPAM plugin
pub const BUILTIN_IPAM_PLUGIN: &str = "ipam";

/// Name of the built-in debug plugin
pub const BUILTIN_DEBUG_PLUGIN: &str = "debug";
