//! # Configuration
//!
//! Process-level configuration loaded from a TOML file, covering:
//! - This node's identity and evaluator settings
//! - Transport carrier settings (§4.6)
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! node_id = "node-1"
//! log_level = "info"
//!
//! [eval]
//! poll_frequency_hz = 10.0
//! max_wait_secs = 5.0
//!
//! [transport]
//! carrier_type = "Udp"
//! hosts = ["127.0.0.1:30000", "127.0.0.1:30001"]
//! id = 0
//! originator_id = "node-1"
//! domain = "fleet"
//! ```

use std::path::Path;

use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::eval::EvalSettings;
use crate::transport::settings::{self, TransportSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub eval: EvalSettings,
    pub transport: TransportSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from a TOML file, applying `$(VAR)`/`${VAR}`
    /// environment expansion to `node_id` and `transport.originator_id`
    /// after parsing (§6.4).
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let mut config: Config = settings.try_deserialize()?;
        config.node_id = settings::expand_env(&config.node_id);
        config.transport.originator_id = settings::expand_env(&config.transport.originator_id);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            log_level: default_log_level(),
            eval: EvalSettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_minimal_toml_with_defaults_filled_in() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            temp_file.as_file_mut(),
            r#"
node_id = "node-7"

[transport]
carrier_type = "Udp"
hosts = ["127.0.0.1:30000"]
id = 7
originator_id = "node-7"
domain = "fleet"
queue_length = 1048576
read_threads = 1
read_thread_hertz = 0.0
max_fragment_size = 60000
slack_time = {{ secs = 0, nanos = 0 }}
resend_attempts = 3
reliability = "BestEffort"
send_reduced_message_header = false
rebroadcast_ttl = 0
participant_rebroadcast_ttl = 8
max_send_bandwidth = -1
max_total_bandwidth = -1
deadline_secs = -1.0
packet_drop_rate = 0.0
packet_drop_type = "Probabilistic"
packet_drop_burst = 1
trusted_peers = []
banned_peers = []
"#
        )
        .unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.transport.domain, "fleet");
    }
}
