pub mod buffer;
pub mod config;
pub mod datalog;
pub mod error;
pub mod instrument;
pub mod metadata;
pub mod scheduler;
pub mod session;
pub mod tuning;
pub mod types;

pub use buffer::{ChannelDataset, DataTable, MeasurementBuffer, SUB_SAMPLE_DELIMITER};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use datalog::Datalog;
pub use error::RamanError;
pub use instrument::solstis::{SolstisClient, SolstisClientBuilder};
pub use instrument::{Bench, HardwareBench, SimBench};
pub use metadata::{raman_shift, RunMetadata};
pub use scheduler::{ExposureScheduler, ExposureSettings, PeriodicChecks};
pub use session::{DatasetSink, RepetitionManager, RunParams, TickStatus};
pub use tuning::{TuningController, TuningLimits};
pub use types::{
    expand_range, AlignmentOutcome, ChannelEntry, ChannelSet, DetectorId, ExposureSample,
    RunState, SessionCommand, Step, SweepProgress, SwitchChannel, TuneOutcome, TuningStatus,
    WavelengthReading,
};
