//! Session driver: repeated measurement passes, pause/resume/stop and
//! dataset finalization.
//!
//! The [`RepetitionManager`] owns all session-wide mutable state -- the
//! bench, the durable buffer, the metadata and the scheduler -- and is
//! driven by a host tick loop. One [`RepetitionManager::tick`] performs
//! at most one command and one scheduler step, so control requests are
//! honored between exposures and never interrupt one.

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{ChannelDataset, MeasurementBuffer};
use crate::config::AppConfig;
use crate::datalog::Datalog;
use crate::error::RamanError;
use crate::instrument::Bench;
use crate::metadata::RunMetadata;
use crate::scheduler::{ExposureScheduler, ExposureSettings, PeriodicChecks};
use crate::tuning::{TuningController, TuningLimits};
use crate::types::{ChannelSet, RunState, SessionCommand, Step, SweepProgress};

/// Parameters of one `begin` request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub experiment_name: String,
    pub medium: String,
    pub notes: String,
    /// Scan targets; empty means "use the session default list".
    pub targets: Vec<f64>,
    /// Exposure time per repetition.
    pub integration: Duration,
    /// Repetition entries per (wavelength, channel) per pass.
    pub repetitions: usize,
    /// Finalized datasets to produce; `None` runs continuously until
    /// stopped.
    pub passes: Option<u32>,
}

/// Receiver of finalized datasets. Exports must be atomic per call: a
/// failed export leaves the durable buffer intact and is retried.
pub trait DatasetSink {
    fn export(
        &mut self,
        name: &str,
        datasets: &[ChannelDataset],
        log: &Datalog,
    ) -> Result<(), RamanError>;
}

/// What one tick accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickStatus {
    /// Nothing to do (idle or paused).
    Idle,
    /// One command or scheduler step was processed.
    Working,
    /// A pass was finalized and exported; the next one is armed.
    PassFinished,
    /// The run is over and the session is idle again.
    Done,
}

struct ActiveRun {
    params: RunParams,
    scheduler: ExposureScheduler,
    durable: MeasurementBuffer,
    scratch: MeasurementBuffer,
    metadata: RunMetadata,
    datalog: Datalog,
    stop_requested: bool,
}

pub struct RepetitionManager {
    bench: Box<dyn Bench>,
    sink: Box<dyn DatasetSink>,
    channels: ChannelSet,
    config: AppConfig,
    commands: Receiver<SessionCommand>,
    progress: Arc<RwLock<SweepProgress>>,
    state: RunState,
    run: Option<ActiveRun>,
    default_targets: Vec<f64>,
}

impl RepetitionManager {
    pub fn new(
        bench: Box<dyn Bench>,
        sink: Box<dyn DatasetSink>,
        channels: ChannelSet,
        config: AppConfig,
        commands: Receiver<SessionCommand>,
    ) -> Self {
        let progress = Arc::new(RwLock::new(SweepProgress {
            state: Some(RunState::Idle),
            connected_detectors: channels.detectors(),
            ..SweepProgress::default()
        }));
        RepetitionManager {
            bench,
            sink,
            channels,
            config,
            commands,
            progress,
            state: RunState::Idle,
            run: None,
            default_targets: Vec::new(),
        }
    }

    /// Shared progress snapshot, safe to read from other threads.
    pub fn progress(&self) -> Arc<RwLock<SweepProgress>> {
        Arc::clone(&self.progress)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Handle at most one pending command, then perform one unit of
    /// work.
    pub fn tick(&mut self) -> Result<TickStatus, RamanError> {
        if let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }

        let status = match self.state {
            RunState::Idle | RunState::Paused => TickStatus::Idle,
            RunState::Running => self.run_step()?,
            RunState::Finalizing => self.finalize_step()?,
        };
        self.publish_progress();
        Ok(status)
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Begin(params) => {
                if self.state != RunState::Idle {
                    warn!("begin ignored: session already active");
                    return;
                }
                self.begin(params);
            }
            SessionCommand::Pause => {
                if self.state == RunState::Running {
                    info!("session paused");
                    self.state = RunState::Paused;
                }
            }
            SessionCommand::Resume => {
                if self.state == RunState::Paused {
                    info!("session resumed");
                    self.state = RunState::Running;
                }
            }
            SessionCommand::Stop => match self.state {
                RunState::Running | RunState::Paused => {
                    info!("stop requested, finalizing partial data");
                    if let Some(run) = &mut self.run {
                        run.stop_requested = true;
                        run.datalog.add("stop requested by operator");
                    }
                    self.state = RunState::Finalizing;
                }
                _ => {}
            },
            SessionCommand::SetTargets(targets) => {
                if self.run.is_some() {
                    warn!("target list change ignored while a run is active");
                } else {
                    self.default_targets = targets;
                }
            }
            SessionCommand::SetChannels(entries) => {
                if self.run.is_some() {
                    warn!("channel mapping change ignored while a run is active");
                } else {
                    self.channels = ChannelSet::new(entries);
                }
            }
        }
    }

    /// Arm a new run. Targets come from the request or, when absent,
    /// from the session default list.
    pub fn begin(&mut self, mut params: RunParams) {
        if params.targets.is_empty() {
            params.targets = self.default_targets.clone();
        }
        if params.targets.is_empty() {
            warn!("begin ignored: no target wavelengths");
            return;
        }
        if self.channels.is_empty() {
            warn!("begin ignored: no detector channels");
            return;
        }

        let mut metadata = self.metadata_for(&params);
        metadata.begin(&params.targets);

        let tick = Duration::from_millis(self.config.detectors.integration_tick_ms);
        let settings = ExposureSettings::from_config(
            &self.config.sweep,
            params.integration,
            tick,
            params.repetitions,
        );
        let tuner = TuningController::new(TuningLimits::from_config(&self.config.sweep));
        let scheduler = ExposureScheduler::new(
            settings,
            PeriodicChecks::from_config(&self.config.sweep),
            tuner,
            params.targets.clone(),
            self.channels.clone(),
        );

        let tolerance = self.config.sweep.wavelength_tolerance_nm;
        let mut datalog = Datalog::new();
        datalog.add(format!(
            "run started: {} targets, {} repetitions, integration {:?}",
            params.targets.len(),
            params.repetitions,
            params.integration,
        ));
        info!(
            "run started: {} ({} targets, {} repetitions)",
            metadata.dataset_name(),
            params.targets.len(),
            params.repetitions
        );

        self.run = Some(ActiveRun {
            durable: MeasurementBuffer::new(params.repetitions, tolerance),
            scratch: MeasurementBuffer::new(params.repetitions, tolerance),
            params,
            scheduler,
            metadata,
            datalog,
            stop_requested: false,
        });
        self.state = RunState::Running;
    }

    fn metadata_for(&self, params: &RunParams) -> RunMetadata {
        RunMetadata {
            experiment_name: params.experiment_name.clone(),
            medium: params.medium.clone(),
            notes: params.notes.clone(),
            laser: "SolsTiS".to_string(),
            spad_name: None,
            switch_channel: None,
            filter_wavelength_nm: self.config.laser.filter_wavelength_nm,
            spad_integration_time_ms: self.config.detectors.integration_tick_ms,
            spad_bias_v: self.config.detectors.bias_v,
            spad_threshold_v: self.config.detectors.threshold_v,
            integration_s: params.integration.as_secs(),
            repetitions: params.repetitions,
            seq_num: 1,
            excitation_wavelengths: Vec::new(),
            excitation_ramanshifts: Vec::new(),
            starttime: None,
            endtime: None,
        }
    }

    fn run_step(&mut self) -> Result<TickStatus, RamanError> {
        let run = match &mut self.run {
            Some(run) => run,
            None => {
                self.state = RunState::Idle;
                return Ok(TickStatus::Idle);
            }
        };

        match run.scheduler.step(self.bench.as_mut())? {
            Step::Tuned {
                target_nm,
                measured_nm,
            } => {
                run.datalog
                    .add(format!("tuned to {target_nm} nm (measured {measured_nm} nm)"));
            }
            Step::TuningFailed { target_nm } => {
                run.datalog
                    .add(format!("tuning to {target_nm} nm failed, queued for retry"));
            }
            Step::Sample(sample) => {
                debug!(
                    "sample: {} at {} nm, repetition {}",
                    sample.detector, sample.wavelength_nm, sample.repetition
                );
                run.scratch.record(&sample);
                run.durable.merge(&mut run.scratch);

                if run.scheduler.autosave_due() {
                    run.scheduler.autosave_taken();
                    Self::autosave(
                        self.sink.as_mut(),
                        run,
                        &self.channels,
                    );
                }
            }
            Step::PassComplete { unreached } => {
                if !unreached.is_empty() {
                    run.datalog
                        .add(format!("pass ended with unreached wavelengths: {unreached:?}"));
                }
                self.state = RunState::Finalizing;
            }
        }
        Ok(TickStatus::Working)
    }

    /// Incremental backup export of whatever the durable buffer holds.
    /// Never clears the buffer; a failure only logs.
    fn autosave(sink: &mut dyn DatasetSink, run: &mut ActiveRun, channels: &ChannelSet) {
        let mut metadata = run.metadata.clone();
        metadata.finalize_pass(&run.durable.wavelengths_present());
        let name = format!("{}_backup", metadata.dataset_name());
        let result = run
            .durable
            .finalize(&metadata, channels, false)
            .and_then(|datasets| sink.export(&name, &datasets, &run.datalog));
        match result {
            Ok(()) => {
                run.datalog.add("autosave written");
                info!("autosave written: {name}");
            }
            Err(e) => warn!("autosave failed: {e}"),
        }
    }

    /// Finalize the pass, export it, and either re-arm the scheduler for
    /// the next pass or return to idle. A failed export keeps the state
    /// so the next tick retries it.
    fn finalize_step(&mut self) -> Result<TickStatus, RamanError> {
        let run = match &mut self.run {
            Some(run) => run,
            None => {
                self.state = RunState::Idle;
                return Ok(TickStatus::Idle);
            }
        };

        let require_complete = !run.stop_requested;
        let present = if require_complete {
            run.durable.wavelengths_complete()
        } else {
            run.durable.wavelengths_present()
        };
        run.metadata.finalize_pass(&present);

        if !run.durable.is_empty() || !require_complete {
            let datasets = run
                .durable
                .finalize(&run.metadata, &self.channels, require_complete)?;
            let name = run.metadata.dataset_name();
            run.datalog.add(format!("finalized dataset {name}"));
            if let Err(e) = self.sink.export(&name, &datasets, &run.datalog) {
                error!("export of {name} failed, will retry: {e}");
                return Ok(TickStatus::Working);
            }
            info!("dataset exported: {name}");
        }
        run.durable.reset();

        let passes_done = run.metadata.seq_num;
        let finished = run.stop_requested
            || run.params.passes.is_some_and(|total| passes_done >= total);
        if finished {
            info!("run finished after {passes_done} pass(es)");
            self.run = None;
            self.state = RunState::Idle;
            return Ok(TickStatus::Done);
        }

        run.metadata = run.metadata.next_repetition();
        run.metadata.begin(&run.params.targets);
        run.scheduler.rearm(run.params.targets.clone());
        run.datalog = Datalog::new();
        run.datalog
            .add(format!("pass {} started", run.metadata.seq_num));
        self.state = RunState::Running;
        Ok(TickStatus::PassFinished)
    }

    fn publish_progress(&self) {
        let mut progress = self.progress.write();
        progress.state = Some(self.state);
        progress.connected_detectors = self.channels.detectors();
        match &self.run {
            Some(run) => {
                progress.pass_seq = run.metadata.seq_num;
                run.scheduler.report(&mut progress);
            }
            None => {
                progress.pass_seq = 0;
                progress.current_wavelength_nm = None;
                progress.current_repetition = 0;
                progress.failed_wavelengths.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimBench;
    use crate::types::DetectorId;
    use crossbeam_channel::unbounded;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct CapturedExport {
        name: String,
        datasets: Vec<ChannelDataset>,
        log_lines: usize,
    }

    /// Sink recording every export; optionally fails the first N calls.
    #[derive(Default)]
    struct RecordingSink {
        exports: Rc<RefCell<Vec<CapturedExport>>>,
        fail_next: Rc<RefCell<u32>>,
    }

    impl DatasetSink for RecordingSink {
        fn export(
            &mut self,
            name: &str,
            datasets: &[ChannelDataset],
            log: &Datalog,
        ) -> Result<(), RamanError> {
            let mut fail_next = self.fail_next.borrow_mut();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(RamanError::Export("disk full".to_string()));
            }
            self.exports.borrow_mut().push(CapturedExport {
                name: name.to_string(),
                datasets: datasets.to_vec(),
                log_lines: log.len(),
            });
            Ok(())
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sweep.settle_wait_s = 0;
        config.sweep.measurement_delay_s = 0;
        config.sweep.check_wavelength = false;
        config.sweep.check_alignment = false;
        config.sweep.auto_backup = false;
        config.detectors.integration_tick_ms = 1;
        config
    }

    fn params(targets: Vec<f64>, repetitions: usize, passes: Option<u32>) -> RunParams {
        RunParams {
            experiment_name: "sample".to_string(),
            medium: "water".to_string(),
            notes: String::new(),
            targets,
            integration: Duration::from_millis(2),
            repetitions,
            passes,
        }
    }

    fn manager(
        bench: SimBench,
        sink: RecordingSink,
    ) -> (RepetitionManager, crossbeam_channel::Sender<SessionCommand>) {
        let (tx, rx) = unbounded();
        let manager = RepetitionManager::new(
            Box::new(bench),
            Box::new(sink),
            SimBench::channel_set(),
            fast_config(),
            rx,
        );
        (manager, tx)
    }

    fn drive_until_idle(manager: &mut RepetitionManager, limit: usize) {
        for _ in 0..limit {
            manager.tick().unwrap();
            if manager.state() == RunState::Idle {
                return;
            }
        }
        panic!("session did not reach idle within {limit} ticks");
    }

    #[test]
    fn one_pass_produces_one_complete_dataset() {
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::Begin(params(
            vec![800.0, 801.0, 802.0],
            2,
            Some(1),
        )))
        .unwrap();
        drive_until_idle(&mut manager, 200);

        let exports = exports.borrow();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].name, "sample_1");
        // Two detector channels, each with a 2-row x 3-column table.
        assert_eq!(exports[0].datasets.len(), 2);
        for dataset in &exports[0].datasets {
            assert_eq!(dataset.counts.wavelengths, vec![800.0, 801.0, 802.0]);
            assert_eq!(dataset.counts.cells.len(), 2);
        }
        assert!(exports[0].log_lines > 0);
    }

    #[test]
    fn repeated_passes_bump_the_sequence_number() {
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::Begin(params(vec![800.0], 1, Some(3))))
            .unwrap();
        drive_until_idle(&mut manager, 400);

        let names: Vec<String> = exports.borrow().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["sample_1", "sample_2", "sample_3"]);
    }

    #[test]
    fn unreached_wavelength_is_dropped_from_a_complete_dataset() {
        let mut bench = SimBench::new();
        bench.fail_targets.push(801.0);
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let (mut manager, tx) = manager(bench, sink);

        tx.send(SessionCommand::Begin(params(
            vec![800.0, 801.0, 802.0],
            2,
            Some(1),
        )))
        .unwrap();
        drive_until_idle(&mut manager, 400);

        let exports = exports.borrow();
        assert_eq!(exports[0].datasets[0].counts.wavelengths, vec![800.0, 802.0]);
    }

    #[test]
    fn stop_finalizes_partial_data_rectangularly() {
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::Begin(params(
            vec![800.0, 801.0, 802.0],
            2,
            Some(1),
        )))
        .unwrap();

        // Tune 800, collect both repetitions on both channels, tune 801,
        // collect one repetition: 1 + 4 + 1 + 1 ticks.
        for _ in 0..7 {
            manager.tick().unwrap();
        }
        tx.send(SessionCommand::Stop).unwrap();
        drive_until_idle(&mut manager, 50);

        let exports = exports.borrow();
        assert_eq!(exports.len(), 1);
        let table = &exports[0].datasets[0].counts;
        // 801 reached a single repetition on the first channel, so every
        // column is truncated to one row.
        assert_eq!(table.wavelengths, vec![800.0, 801.0]);
        assert_eq!(table.cells.len(), 1);
    }

    #[test]
    fn pause_halts_progress_until_resume() {
        let sink = RecordingSink::default();
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::Begin(params(vec![800.0], 2, Some(1))))
            .unwrap();
        manager.tick().unwrap(); // begin + tune
        tx.send(SessionCommand::Pause).unwrap();
        for _ in 0..5 {
            assert_eq!(manager.tick().unwrap(), TickStatus::Idle);
        }
        assert_eq!(manager.state(), RunState::Paused);
        tx.send(SessionCommand::Resume).unwrap();
        drive_until_idle(&mut manager, 100);
    }

    #[test]
    fn failed_export_is_retried_and_preserves_data() {
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let fail_next = Rc::clone(&sink.fail_next);
        *fail_next.borrow_mut() = 2;
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::Begin(params(vec![800.0], 1, Some(1))))
            .unwrap();
        drive_until_idle(&mut manager, 100);

        let exports = exports.borrow();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].datasets[0].counts.cells.len(), 1);
    }

    #[test]
    fn begin_without_targets_uses_the_session_default() {
        let sink = RecordingSink::default();
        let exports = Rc::clone(&sink.exports);
        let (mut manager, tx) = manager(SimBench::new(), sink);

        tx.send(SessionCommand::SetTargets(vec![800.0, 800.5]))
            .unwrap();
        manager.tick().unwrap();
        tx.send(SessionCommand::Begin(params(Vec::new(), 1, Some(1))))
            .unwrap();
        drive_until_idle(&mut manager, 100);

        assert_eq!(
            exports.borrow()[0].datasets[0].counts.wavelengths,
            vec![800.0, 800.5]
        );
    }

    #[test]
    fn progress_snapshot_tracks_the_run() {
        let sink = RecordingSink::default();
        let (mut manager, tx) = manager(SimBench::new(), sink);
        let progress = manager.progress();

        tx.send(SessionCommand::Begin(params(vec![800.0], 2, Some(1))))
            .unwrap();
        manager.tick().unwrap(); // begin + tune
        {
            let snapshot = progress.read();
            assert_eq!(snapshot.state, Some(RunState::Running));
            assert_eq!(snapshot.pass_seq, 1);
            assert_eq!(snapshot.current_wavelength_nm, Some(800.0));
            assert_eq!(
                snapshot.connected_detectors,
                vec![DetectorId::new("sim-spad-a"), DetectorId::new("sim-spad-b")]
            );
        }
        drive_until_idle(&mut manager, 100);
        assert_eq!(progress.read().state, Some(RunState::Idle));
    }
}
