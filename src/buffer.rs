//! Accumulation of exposure samples and conversion into per-channel
//! tables.
//!
//! The buffer is keyed by detector, then by nominal target wavelength.
//! Wavelength keys are matched with the tuning tolerance so nominally
//! equal targets never split into separate columns. Repetition entries
//! are appended in arrival order, capped at the configured repetition
//! target, and never reordered or overwritten.

use log::warn;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::RamanError;
use crate::metadata::RunMetadata;
use crate::types::{ChannelSet, DetectorId, ExposureSample};

/// Joins the sub-samples of one repetition into a single table cell.
pub const SUB_SAMPLE_DELIMITER: char = '~';

/// One wavelength column: ordered repetition entries, each the sequence
/// of sub-samples from one integration window.
#[derive(Debug, Clone, PartialEq, Default)]
struct WavelengthColumn {
    wavelength_nm: f64,
    counts: Vec<Vec<f64>>,
    powers: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementBuffer {
    store: BTreeMap<DetectorId, Vec<WavelengthColumn>>,
    repetition_target: usize,
    key_tolerance_nm: f64,
}

impl MeasurementBuffer {
    pub fn new(repetition_target: usize, key_tolerance_nm: f64) -> Self {
        MeasurementBuffer {
            store: BTreeMap::new(),
            repetition_target,
            key_tolerance_nm,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.store.values().all(|columns| columns.is_empty())
    }

    pub fn detectors(&self) -> Vec<DetectorId> {
        self.store.keys().cloned().collect()
    }

    /// Repetition entries held for one (detector, wavelength) key.
    pub fn repetition_count(&self, detector: &DetectorId, wavelength_nm: f64) -> usize {
        self.store
            .get(detector)
            .and_then(|columns| find_column(columns, wavelength_nm, self.key_tolerance_nm))
            .map_or(0, |column| column.counts.len())
    }

    /// Wavelengths holding at least one repetition on any detector.
    pub fn wavelengths_present(&self) -> Vec<f64> {
        let mut present: Vec<f64> = Vec::new();
        for columns in self.store.values() {
            for column in columns {
                let known = present
                    .iter()
                    .any(|wl| (wl - column.wavelength_nm).abs() <= self.key_tolerance_nm);
                if !known && !column.counts.is_empty() {
                    present.push(column.wavelength_nm);
                }
            }
        }
        present.sort_by(|a, b| a.total_cmp(b));
        present
    }

    /// Wavelengths that reached the full repetition target on at least
    /// one detector.
    pub fn wavelengths_complete(&self) -> Vec<f64> {
        let mut complete: Vec<f64> = Vec::new();
        for columns in self.store.values() {
            for column in columns {
                let known = complete
                    .iter()
                    .any(|wl| (wl - column.wavelength_nm).abs() <= self.key_tolerance_nm);
                if !known && column.counts.len() >= self.repetition_target {
                    complete.push(column.wavelength_nm);
                }
            }
        }
        complete.sort_by(|a, b| a.total_cmp(b));
        complete
    }

    /// Append one exposure. A key already holding the full repetition
    /// target drops the sample rather than exceeding the cap.
    pub fn record(&mut self, sample: &ExposureSample) {
        let target = self.repetition_target;
        let column = self.column_mut(&sample.detector, sample.wavelength_nm);
        if column.counts.len() >= target {
            warn!(
                "dropping extra repetition for {} at {} nm",
                sample.detector, sample.wavelength_nm
            );
            return;
        }
        column.counts.push(sample.counts.clone());
        column.powers.push(sample.powers.clone());
    }

    /// Fold another buffer's entries into this one, preserving existing
    /// entries and the repetition cap, then clear the source.
    pub fn merge(&mut self, incoming: &mut MeasurementBuffer) {
        let tolerance = self.key_tolerance_nm;
        let target = self.repetition_target;
        for (detector, columns) in std::mem::take(&mut incoming.store) {
            let own = self.store.entry(detector).or_default();
            for column in columns {
                let index = match own
                    .iter()
                    .position(|c| (c.wavelength_nm - column.wavelength_nm).abs() <= tolerance)
                {
                    Some(index) => index,
                    None => {
                        own.push(WavelengthColumn {
                            wavelength_nm: column.wavelength_nm,
                            ..WavelengthColumn::default()
                        });
                        own.len() - 1
                    }
                };
                let slot = &mut own[index];
                for (counts, powers) in column.counts.into_iter().zip(column.powers) {
                    if slot.counts.len() >= target {
                        break;
                    }
                    slot.counts.push(counts);
                    slot.powers.push(powers);
                }
            }
        }
    }

    /// Convert the store into one dataset per detector without mutating
    /// it, so a failed export can simply retry.
    ///
    /// With `require_complete`, wavelengths short of the repetition
    /// target are dropped whole; otherwise every column is truncated to
    /// the shortest present repetition count so the table is rectangular.
    pub fn finalize(
        &self,
        metadata: &RunMetadata,
        channels: &ChannelSet,
        require_complete: bool,
    ) -> Result<Vec<ChannelDataset>, RamanError> {
        let mut datasets = Vec::new();
        for (detector, columns) in &self.store {
            let kept: Vec<&WavelengthColumn> = if require_complete {
                columns
                    .iter()
                    .filter(|c| c.counts.len() >= self.repetition_target)
                    .collect()
            } else {
                columns.iter().filter(|c| !c.counts.is_empty()).collect()
            };
            if kept.is_empty() {
                continue;
            }
            let rows = if require_complete {
                self.repetition_target
            } else {
                kept.iter().map(|c| c.counts.len()).min().unwrap_or(0)
            };

            let channel = channels
                .iter()
                .find(|e| &e.detector == detector)
                .map(|e| e.switch_channel);
            let meta = match channel {
                Some(channel) => metadata.for_detector(detector, channel),
                None => metadata.clone(),
            };
            let metadata_line = serde_json::to_string(&meta)?;

            let wavelengths: Vec<f64> = kept.iter().map(|c| c.wavelength_nm).collect();
            let counts = DataTable {
                metadata_line: metadata_line.clone(),
                wavelengths: wavelengths.clone(),
                cells: collect_cells(&kept, rows, |c| &c.counts),
            };
            let powers = DataTable {
                metadata_line,
                wavelengths,
                cells: collect_cells(&kept, rows, |c| &c.powers),
            };
            datasets.push(ChannelDataset {
                detector: detector.clone(),
                counts,
                powers,
            });
        }
        Ok(datasets)
    }

    /// Drop every entry. Called only after a successful export.
    pub fn reset(&mut self) {
        self.store.clear();
    }

    /// Re-merge a parsed counts/powers table pair, as when resuming from
    /// an autosaved dataset.
    pub fn absorb_tables(
        &mut self,
        detector: &DetectorId,
        counts: &DataTable,
        powers: &DataTable,
    ) -> Result<(), RamanError> {
        if counts.wavelengths != powers.wavelengths || counts.cells.len() != powers.cells.len() {
            return Err(RamanError::TableFormat(
                "counts and powers tables disagree".to_string(),
            ));
        }
        for (row_idx, row) in counts.cells.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                let target = self.repetition_target;
                let column = self.column_mut(detector, counts.wavelengths[col_idx]);
                if column.counts.len() >= target {
                    continue;
                }
                column.counts.push(cell.clone());
                column.powers.push(powers.cells[row_idx][col_idx].clone());
            }
        }
        Ok(())
    }

    fn column_mut(&mut self, detector: &DetectorId, wavelength_nm: f64) -> &mut WavelengthColumn {
        let tolerance = self.key_tolerance_nm;
        let columns = self.store.entry(detector.clone()).or_default();
        let index = match columns
            .iter()
            .position(|c| (c.wavelength_nm - wavelength_nm).abs() <= tolerance)
        {
            Some(index) => index,
            None => {
                columns.push(WavelengthColumn {
                    wavelength_nm,
                    ..WavelengthColumn::default()
                });
                columns.len() - 1
            }
        };
        &mut columns[index]
    }
}

fn find_column<'a>(
    columns: &'a [WavelengthColumn],
    wavelength_nm: f64,
    tolerance: f64,
) -> Option<&'a WavelengthColumn> {
    columns
        .iter()
        .find(|c| (c.wavelength_nm - wavelength_nm).abs() <= tolerance)
}

fn collect_cells<'a>(
    kept: &[&'a WavelengthColumn],
    rows: usize,
    field: impl Fn(&'a WavelengthColumn) -> &'a Vec<Vec<f64>>,
) -> Vec<Vec<Vec<f64>>> {
    (0..rows)
        .map(|row| {
            kept.iter()
                .map(|column| field(column).get(row).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}

/// Finalized tables for one detector channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDataset {
    pub detector: DetectorId,
    pub counts: DataTable,
    pub powers: DataTable,
}

/// A rectangular repetition-by-wavelength table plus its metadata line.
///
/// Rendered form: one JSON metadata line, a header of `n_sample`
/// followed by the wavelength of each column, then one line per
/// repetition where each cell joins the sub-samples with
/// [`SUB_SAMPLE_DELIMITER`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    pub metadata_line: String,
    pub wavelengths: Vec<f64>,
    /// `cells[row][column]` is the sub-sample sequence of one repetition.
    pub cells: Vec<Vec<Vec<f64>>>,
}

impl DataTable {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.metadata_line);
        out.push('\n');
        out.push_str("n_sample");
        for wavelength in &self.wavelengths {
            out.push(',');
            out.push_str(&wavelength.to_string());
        }
        out.push('\n');
        for (row_idx, row) in self.cells.iter().enumerate() {
            out.push_str(&(row_idx + 1).to_string());
            for cell in row {
                out.push(',');
                let joined: Vec<String> = cell.iter().map(f64::to_string).collect();
                out.push_str(&joined.join(&SUB_SAMPLE_DELIMITER.to_string()));
            }
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, RamanError> {
        let mut lines = text.lines();
        let metadata_line = lines
            .next()
            .ok_or_else(|| RamanError::TableFormat("empty table".to_string()))?
            .to_string();
        // The metadata line must at least be valid JSON.
        let _: Value = serde_json::from_str(&metadata_line)?;

        let header = lines
            .next()
            .ok_or_else(|| RamanError::TableFormat("missing header".to_string()))?;
        let mut fields = header.split(',');
        if fields.next() != Some("n_sample") {
            return Err(RamanError::TableFormat(
                "header does not start with n_sample".to_string(),
            ));
        }
        let wavelengths = fields
            .map(|f| {
                f.trim()
                    .parse::<f64>()
                    .map_err(|_| RamanError::TableFormat(format!("bad wavelength {f:?}")))
            })
            .collect::<Result<Vec<f64>, RamanError>>()?;

        let mut cells = Vec::new();
        for line in lines.filter(|l| !l.trim().is_empty()) {
            let mut fields = line.split(',');
            fields.next(); // repetition index column
            let row = fields
                .map(parse_cell)
                .collect::<Result<Vec<Vec<f64>>, RamanError>>()?;
            if row.len() != wavelengths.len() {
                return Err(RamanError::TableFormat(format!(
                    "row has {} cells, header has {} wavelengths",
                    row.len(),
                    wavelengths.len()
                )));
            }
            cells.push(row);
        }
        Ok(DataTable {
            metadata_line,
            wavelengths,
            cells,
        })
    }
}

fn parse_cell(cell: &str) -> Result<Vec<f64>, RamanError> {
    cell.split(SUB_SAMPLE_DELIMITER)
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| RamanError::TableFormat(format!("bad sub-sample {v:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(
        detector: &str,
        wavelength_nm: f64,
        repetition: usize,
        counts: Vec<f64>,
    ) -> ExposureSample {
        ExposureSample {
            detector: DetectorId::new(detector),
            wavelength_nm,
            measured_nm: wavelength_nm + 0.002,
            repetition,
            powers: counts.iter().map(|c| c * 1e-9).collect(),
            counts,
            elapsed_s: 0.0,
        }
    }

    fn channels() -> ChannelSet {
        use crate::types::{ChannelEntry, SwitchChannel};
        ChannelSet::new(vec![ChannelEntry {
            detector: DetectorId::new("spad-a"),
            switch_channel: SwitchChannel(1),
        }])
    }

    fn metadata() -> RunMetadata {
        RunMetadata::default()
    }

    #[test]
    fn record_caps_at_the_repetition_target() {
        let mut buffer = MeasurementBuffer::new(2, 0.01);
        for rep in 0..4 {
            buffer.record(&sample("spad-a", 800.0, rep, vec![1.0, 2.0]));
        }
        assert_eq!(buffer.repetition_count(&DetectorId::new("spad-a"), 800.0), 2);
    }

    #[test]
    fn near_equal_wavelengths_share_a_column() {
        let mut buffer = MeasurementBuffer::new(4, 0.01);
        buffer.record(&sample("spad-a", 800.0, 0, vec![1.0]));
        buffer.record(&sample("spad-a", 800.004, 1, vec![2.0]));
        assert_eq!(buffer.repetition_count(&DetectorId::new("spad-a"), 800.0), 2);
        assert_eq!(buffer.wavelengths_present(), vec![800.0]);
    }

    #[test]
    fn merge_appends_and_respects_the_cap() {
        let mut durable = MeasurementBuffer::new(2, 0.01);
        durable.record(&sample("spad-a", 800.0, 0, vec![1.0]));

        let mut scratch = MeasurementBuffer::new(2, 0.01);
        scratch.record(&sample("spad-a", 800.0, 1, vec![2.0]));
        scratch.record(&sample("spad-a", 800.0, 2, vec![3.0]));
        scratch.record(&sample("spad-a", 801.0, 0, vec![4.0]));

        durable.merge(&mut scratch);
        assert!(scratch.is_empty());
        assert_eq!(durable.repetition_count(&DetectorId::new("spad-a"), 800.0), 2);
        assert_eq!(durable.repetition_count(&DetectorId::new("spad-a"), 801.0), 1);
    }

    #[test]
    fn finalize_require_complete_drops_short_columns() {
        let mut buffer = MeasurementBuffer::new(2, 0.01);
        for rep in 0..2 {
            buffer.record(&sample("spad-a", 800.0, rep, vec![1.0]));
            buffer.record(&sample("spad-a", 802.0, rep, vec![3.0]));
        }
        buffer.record(&sample("spad-a", 801.0, 0, vec![2.0]));

        let datasets = buffer.finalize(&metadata(), &channels(), true).unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].counts.wavelengths, vec![800.0, 802.0]);
        assert_eq!(datasets[0].counts.cells.len(), 2);
    }

    #[test]
    fn finalize_partial_truncates_to_rectangular() {
        let mut buffer = MeasurementBuffer::new(2, 0.01);
        for rep in 0..2 {
            buffer.record(&sample("spad-a", 800.0, rep, vec![1.0]));
            buffer.record(&sample("spad-a", 801.0, rep, vec![2.0]));
        }
        buffer.record(&sample("spad-a", 802.0, 0, vec![3.0]));

        let datasets = buffer.finalize(&metadata(), &channels(), false).unwrap();
        let table = &datasets[0].counts;
        assert_eq!(table.wavelengths, vec![800.0, 801.0, 802.0]);
        assert_eq!(table.cells.len(), 1);
        assert!(table.cells[0].iter().all(|cell| cell.len() == 1));
    }

    #[test]
    fn finalize_leaves_the_store_untouched() {
        let mut buffer = MeasurementBuffer::new(1, 0.01);
        buffer.record(&sample("spad-a", 800.0, 0, vec![1.0]));
        let before = buffer.repetition_count(&DetectorId::new("spad-a"), 800.0);
        let _ = buffer.finalize(&metadata(), &channels(), true).unwrap();
        assert_eq!(
            buffer.repetition_count(&DetectorId::new("spad-a"), 800.0),
            before
        );
    }

    #[test]
    fn rendered_table_round_trips() {
        let mut buffer = MeasurementBuffer::new(2, 0.01);
        for rep in 0..2 {
            buffer.record(&sample("spad-a", 800.0, rep, vec![12.0, 13.5, 11.0]));
            buffer.record(&sample("spad-a", 801.0, rep, vec![7.25, 8.0, 9.0]));
        }
        let datasets = buffer.finalize(&metadata(), &channels(), true).unwrap();
        let rendered = datasets[0].counts.render();

        let parsed = DataTable::parse(&rendered).unwrap();
        assert_eq!(parsed, datasets[0].counts);
        assert_eq!(parsed.render(), rendered);

        // Re-merging the parsed table reproduces the sub-sample sequences.
        let mut restored = MeasurementBuffer::new(2, 0.01);
        restored
            .absorb_tables(&DetectorId::new("spad-a"), &parsed, &datasets[0].powers)
            .unwrap();
        let again = restored.finalize(&metadata(), &channels(), true).unwrap();
        assert_eq!(again[0].counts.cells, datasets[0].counts.cells);
    }

    #[test]
    fn parse_rejects_ragged_rows() {
        let text = "{\"a\":1}\nn_sample,800,801\n1,1~2\n";
        assert!(matches!(
            DataTable::parse(text),
            Err(RamanError::TableFormat(_))
        ));
    }
}
