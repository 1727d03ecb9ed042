pub mod schema;

pub use schema::{
    resolve_config_path, Config, MqttConfig, ReliabilityConfig, WorkerConfig, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_FILE,
};
