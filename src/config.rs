use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub laser: LaserConfig,
    pub detectors: DetectorConfig,
    pub sweep: SweepConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LaserConfig {
    pub host: String,
    pub port: u16,
    /// Client IP registered with the ICE BLOC controller on start_link.
    pub client_ip: String,
    pub connect_timeout_s: u64,
    pub read_timeout_s: u64,
    /// Filter edge wavelength for derived Raman-shift units [nm].
    pub filter_wavelength_nm: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Detector address -> optical switch channel.
    pub channel_map: BTreeMap<String, u8>,
    /// Serial port of the optical switch.
    pub switch_port: String,
    /// Serial port of the power reference meter.
    pub power_meter_port: String,
    /// Hardware integration tick of the SPAD [ms].
    pub integration_tick_ms: u64,
    pub bias_v: f64,
    pub threshold_v: f64,
    /// Cooling set point [milli-degC].
    pub temp_set_point_mdegc: i64,
    /// Warn when the tap power reading drops below this level [W].
    pub low_power_warning_w: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    /// Acceptance tolerance for a reported tune success [nm].
    pub wavelength_tolerance_nm: f64,
    /// Tolerance for accepting an idle-but-close reading [nm].
    pub idle_tolerance_nm: f64,
    /// Wait between tuning polls [s].
    pub settle_wait_s: u64,
    /// Wait after a switch-channel change [s].
    pub measurement_delay_s: u64,
    pub max_tuning_retries: u32,
    pub max_error_retries: u32,
    /// Whole-call tune invocations before a wavelength is declared failed.
    pub max_tune_calls: u32,
    /// Traversals of the failed-wavelength set before giving up a pass.
    pub max_pass_attempts: u32,
    pub check_wavelength: bool,
    pub check_wavelength_interval_s: u64,
    pub check_alignment: bool,
    pub alignment_interval_s: u64,
    pub auto_backup: bool,
    pub autobackup_interval_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    /// Nullify instrument ops and produce synthetic data.
    pub simulate: bool,
    pub verbosity: String,
    /// Host tick interval driving the scheduler [ms].
    pub prog_interval_ms: u64,
    /// Directory finalized datasets are written to.
    pub working_directory: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            laser: LaserConfig::default(),
            detectors: DetectorConfig::default(),
            sweep: SweepConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9001,
            client_ip: "192.168.1.100".to_string(),
            connect_timeout_s: 5,
            read_timeout_s: 10,
            filter_wavelength_nm: 884.0,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let mut channel_map = BTreeMap::new();
        channel_map.insert("/dev/ttyUSB0".to_string(), 1);
        Self {
            channel_map,
            switch_port: "/dev/ttyS0".to_string(),
            power_meter_port: "/dev/ttyS1".to_string(),
            integration_tick_ms: 1000,
            bias_v: 200.0,
            threshold_v: 0.1,
            temp_set_point_mdegc: -40000,
            low_power_warning_w: 1.0e-7,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            wavelength_tolerance_nm: 0.01,
            idle_tolerance_nm: 0.015,
            settle_wait_s: 2,
            measurement_delay_s: 2,
            max_tuning_retries: 3,
            max_error_retries: 3,
            max_tune_calls: 2,
            max_pass_attempts: 3,
            check_wavelength: true,
            check_wavelength_interval_s: 10,
            check_alignment: false,
            alignment_interval_s: 900,
            auto_backup: true,
            autobackup_interval_s: 3600,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            verbosity: "info".to_string(),
            prog_interval_ms: 500,
            working_directory: "./data".to_string(),
        }
    }
}

impl SweepConfig {
    pub fn settle_wait(&self) -> Duration {
        Duration::from_secs(self.settle_wait_s)
    }

    pub fn measurement_delay(&self) -> Duration {
        Duration::from_secs(self.measurement_delay_s)
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        // Try common config file locations
        let possible_paths = ["config.toml", "raman-sweep.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Add environment variable overrides with prefix "RAMAN_SWEEP_"
    builder = builder.add_source(
        Environment::with_prefix("RAMAN_SWEEP")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
