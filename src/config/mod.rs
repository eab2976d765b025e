//! Configuration types and loading
//!
//! Configuration is a YAML document with role-aware defaults: values left
//! unset are filled in from the machine's CPU count and RAM, scaled
//! differently for `client` and `server` roles, then validated as a whole so
//! the user sees every violation at once.

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub(crate) use types::parse_mac;
pub use types::{
    Config, GfwResistConfig, KcpConfig, ListenConfig, LogConfig, NetTuple, NetworkConfig,
    PcapConfig, PerformanceConfig, QuicConfig, Role, ServerAddrConfig, TransportConfig,
    TransportProtocol, TunConfig,
};
