use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_warning_timeout() -> f64 {
    600.0
}

fn default_backend() -> String {
    "channel".to_owned()
}

fn default_executor() -> String {
    "work_stealing".to_owned()
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_zero_threshold() -> f32 {
    1.0e-12
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds after which blocked collective operations print a potential
    /// deadlock warning, default: 600.0 seconds
    #[serde(default = "default_deadlock_warning_timeout")]
    pub deadlock_warning_timeout: f64,

    /// The fabric backend to use
    /// channel -- multi pe single process execution, the default
    #[serde(default = "default_backend")]
    pub backend: String,

    /// The executor (thread scheduler) to use, default: 'work_stealing'
    #[serde(default = "default_executor")]
    pub executor: String,

    /// The number of worker threads per PE
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// The tile norm below which a freshly computed tile is treated as structurally zero when the
    /// caller does not supply a threshold, default: 1e-12
    #[serde(default = "default_zero_threshold")]
    pub zero_threshold: f32,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("TESSELLAR_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
