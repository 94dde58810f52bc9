// Single consumer of completed task batches. Drains the handle queue in
// submission order, writes the result tables, and accumulates the per-marker
// permutation null distributions plus the whole-run minimum-p trackers.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::task::{
    ResultColumn, ResultRow, StatClass, TaskOutcome, NOT_AVAILABLE, STABLE_YES,
};

/// Worst possible p-value; the per-permutation minimum trackers start here.
const MAX_P_VALUE: f64 = 1.0;

/// Statistics tracked per marker across permutations, in the order of the
/// permutation table columns.
pub const TRACKED_COLUMNS: [ResultColumn; 13] = [
    ResultColumn::OrBoth,
    ResultColumn::OrBothLower,
    ResultColumn::OrBothUpper,
    ResultColumn::OrTest,
    ResultColumn::OrTestLower,
    ResultColumn::OrTestUpper,
    ResultColumn::OrRisk,
    ResultColumn::OrRiskLower,
    ResultColumn::OrRiskUpper,
    ResultColumn::ApPValue,
    ResultColumn::StableAdditive,
    ResultColumn::MultPValue,
    ResultColumn::StableMultiplicative,
];

const PERMUTATION_TABLE_COLUMNS: [&str; 15] = [
    "Interaction_marker",
    "Test_marker",
    "ORa_double_exposure_permutation_pvalue",
    "ORa_double_exposure_lower_limit_permutation_pvalue",
    "ORa_double_exposure_higher_limit_permutation_pvalue",
    "ORa_test_marker_permutation_pvalue",
    "ORa_test_marker_lower_limit_permutation_pvalue",
    "ORa_test_marker_higher_limit_permutation_pvalue",
    "ORa_risk_factor_permutation_pvalue",
    "ORa_risk_factor_lower_limit_permutation_pvalue",
    "ORa_risk_factor_higher_limit_permutation_pvalue",
    "APP_permutation_pvalue",
    "NO_succeded_additive_logistic_regression",
    "Multiplicative_interaction_term_permutation_pvalue",
    "NO_succeded_multiplicative_logistic_regression",
];

const TOTAL_TABLE_COLUMNS: [&str; 4] = [
    "Significance Limit",
    "APP_permutation_pvalue",
    "Significance Limit",
    "Multiplicative_interaction_term_permutation_pvalue",
];

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a permuted statistic is compared against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComparisonRule {
    /// Odds-ratio columns: a hit is a permuted value at least as far from
    /// 1.0 as the baseline.
    DeviationFromUnity,
    /// p-value columns: a hit is a permuted value at or below the baseline.
    LessOrEqual,
    /// Convergence flags: a hit is a permuted fit that is itself stable.
    Stability,
}

fn comparison_rule(column: ResultColumn) -> ComparisonRule {
    match column {
        ResultColumn::StableAdditive | ResultColumn::StableMultiplicative => {
            ComparisonRule::Stability
        }
        ResultColumn::ApPValue | ResultColumn::MultPValue => ComparisonRule::LessOrEqual,
        _ => ComparisonRule::DeviationFromUnity,
    }
}

/// Rolling null-distribution cell for one (marker, statistic) pair.
///
/// `comparisons` counts only valid comparisons: permuted rows masked by a
/// failed fit (or by negative-AP suppression) contribute neither a
/// comparison nor a hit, so a statistic that never yields a usable
/// comparison reports `"NA"`.
#[derive(Debug, Clone, Default)]
pub struct PermutationData {
    baseline: Option<f64>,
    hits: u64,
    comparisons: u64,
}

impl PermutationData {
    pub fn record_baseline(&mut self, cell: Option<&str>) {
        if let Some(value) = cell.and_then(|cell| cell.parse::<f64>().ok()) {
            self.baseline = Some(value);
        }
    }

    pub fn record_baseline_value(&mut self, value: f64) {
        self.baseline = Some(value);
    }

    pub fn record_permutation(
        &mut self,
        cell: Option<&str>,
        column: ResultColumn,
        stable_additive: bool,
        stable_multiplicative: bool,
        suppress_negative_ap: bool,
    ) {
        let Some(cell) = cell else { return };
        let Some(baseline) = self.baseline else { return };

        match column.class() {
            StatClass::Additive if !stable_additive => return,
            StatClass::Multiplicative if !stable_multiplicative => return,
            _ => {}
        }
        if column == ResultColumn::ApPValue && suppress_negative_ap {
            return;
        }

        match comparison_rule(column) {
            ComparisonRule::Stability => {
                self.comparisons += 1;
                if cell == STABLE_YES {
                    self.hits += 1;
                }
            }
            ComparisonRule::DeviationFromUnity => {
                let Ok(value) = cell.parse::<f64>() else { return };
                self.comparisons += 1;
                if (1.0 - value).abs() >= (1.0 - baseline).abs() {
                    self.hits += 1;
                }
            }
            ComparisonRule::LessOrEqual => {
                let Ok(value) = cell.parse::<f64>() else { return };
                self.comparisons += 1;
                if value <= baseline {
                    self.hits += 1;
                }
            }
        }
    }

    /// `hits / comparisons`, or `"NA"` when no valid comparison ever
    /// happened.
    pub fn p_value(&self) -> String {
        if self.baseline.is_none() || self.comparisons == 0 {
            return NOT_AVAILABLE.to_string();
        }
        (self.hits as f64 / self.comparisons as f64).to_string()
    }

    pub fn clear(&mut self) {
        *self = PermutationData::default();
    }
}

/// Accumulator scoped to one interaction marker: opened when its first
/// baseline row arrives, flushed and reset when the next interaction marker
/// begins (or the stream ends).
#[derive(Default)]
struct MarkerPermutationArena {
    ids: Vec<String>,
    indices: HashMap<String, usize>,
    cells: Vec<Vec<PermutationData>>,
}

impl MarkerPermutationArena {
    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn open_baseline(&mut self, marker: &str, row: &ResultRow, threshold: f64) {
        let index = self.ids.len();
        self.ids.push(marker.to_string());
        self.indices.insert(marker.to_string(), index);
        let mut cells = vec![PermutationData::default(); TRACKED_COLUMNS.len()];
        for (cell, column) in cells.iter_mut().zip(TRACKED_COLUMNS) {
            if comparison_rule(column) == ComparisonRule::Stability {
                cell.record_baseline_value(threshold);
            } else {
                cell.record_baseline(row.get(column));
            }
        }
        self.cells.push(cells);
    }

    fn record_permutation(
        &mut self,
        marker: &str,
        row: &ResultRow,
        stable_additive: bool,
        stable_multiplicative: bool,
        suppress_negative_ap: bool,
    ) {
        let Some(&index) = self.indices.get(marker) else {
            warn!("Permuted result for '{}' arrived without a baseline", marker);
            return;
        };
        for (cell, column) in self.cells[index].iter_mut().zip(TRACKED_COLUMNS) {
            cell.record_permutation(
                row.get(column),
                column,
                stable_additive,
                stable_multiplicative,
                suppress_negative_ap,
            );
        }
    }

    /// Writes one row per marker and resets the arena for the next
    /// interaction marker.
    fn flush(
        &mut self,
        writer: &mut BufWriter<File>,
        interaction_marker: &str,
    ) -> Result<(), OutputError> {
        for (id, cells) in self.ids.iter().zip(self.cells.iter()) {
            write!(writer, "{}\t{}", interaction_marker, id)?;
            for cell in cells {
                write!(writer, "\t{}", cell.p_value())?;
            }
            writeln!(writer)?;
        }
        self.ids.clear();
        self.indices.clear();
        self.cells.clear();
        Ok(())
    }
}

fn create_output_file(directory: &Path, name: &str) -> Result<BufWriter<File>, OutputError> {
    Ok(BufWriter::new(File::create(directory.join(name))?))
}

/// Removes result files left behind by a previous run in the same directory.
pub fn clear_previous_results(directory: &Path) -> std::io::Result<()> {
    for name in [
        "results.txt",
        "marker_permutation_results.txt",
        "total_permutation_results.txt",
        "total_permutations.txt",
    ] {
        remove_if_present(&directory.join(name))?;
    }
    for index in 1.. {
        let path = directory.join(format!("results_permutation_{}.txt", index));
        if !path.exists() {
            break;
        }
        remove_if_present(&path)?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// The single consumer. Owns every piece of cross-permutation state; workers
/// only ever reach it through the ordered handle queue.
pub struct ResultConsumer {
    output_directory: PathBuf,
    permutations: usize,
    permutation_output: bool,
    total_permutation_output: bool,
    allow_negative_ap: bool,
    ap_limits: Vec<f64>,
    mult_limits: Vec<f64>,
}

/// Completion handle of one submitted batch.
pub type BatchHandle = flume::Receiver<Vec<TaskOutcome>>;

impl ResultConsumer {
    pub fn new(config: &AnalysisConfig, ap_limits: Vec<f64>, mult_limits: Vec<f64>) -> Self {
        ResultConsumer {
            output_directory: config.output_directory.clone(),
            permutations: config.permutations,
            permutation_output: config.permutation_output,
            total_permutation_output: config.total_permutation_output,
            allow_negative_ap: config.allow_negative_ap,
            ap_limits,
            mult_limits,
        }
    }

    /// Blocks on each queued handle in submission order until the queue's
    /// sender side is dropped, then emits the summary tables.
    pub fn run(mut self, handles: flume::Receiver<BatchHandle>) -> Result<(), OutputError> {
        let mut results = create_output_file(&self.output_directory, "results.txt")?;
        writeln!(results, "{}", ResultRow::header())?;

        let mut permutation_table = if self.permutations > 0 {
            let mut writer =
                create_output_file(&self.output_directory, "marker_permutation_results.txt")?;
            writeln!(writer, "{}", PERMUTATION_TABLE_COLUMNS.join("\t"))?;
            Some(writer)
        } else {
            None
        };
        let mut raw_outputs: HashMap<usize, BufWriter<File>> = HashMap::new();

        // Whole-run minimum trackers, one slot per permutation index.
        let mut minimum_ap = vec![MAX_P_VALUE; self.permutations + 1];
        let mut minimum_mult = vec![MAX_P_VALUE; self.permutations + 1];

        let mut arena = MarkerPermutationArena::default();
        let mut current_interaction = String::new();

        for handle in handles.iter() {
            let outcomes = match handle.recv() {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    error!("A worker abandoned its batch without reporting a result");
                    continue;
                }
            };
            for outcome in outcomes {
                let row = match outcome {
                    Ok(row) => row,
                    Err(err) => {
                        error!("Task failed: {}", err);
                        continue;
                    }
                };
                self.consume_row(
                    row,
                    &mut results,
                    &mut permutation_table,
                    &mut raw_outputs,
                    &mut minimum_ap,
                    &mut minimum_mult,
                    &mut arena,
                    &mut current_interaction,
                )?;
            }
        }

        results.flush()?;
        if let Some(mut writer) = permutation_table {
            if !arena.is_empty() {
                arena.flush(&mut writer, &current_interaction)?;
            }
            writer.flush()?;
        }
        for writer in raw_outputs.values_mut() {
            writer.flush()?;
        }

        if self.permutations > 0 {
            self.write_summary_tables(&minimum_ap, &minimum_mult)?;
        }
        info!("Result aggregation finished");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn consume_row(
        &mut self,
        row: ResultRow,
        results: &mut BufWriter<File>,
        permutation_table: &mut Option<BufWriter<File>>,
        raw_outputs: &mut HashMap<usize, BufWriter<File>>,
        minimum_ap: &mut [f64],
        minimum_mult: &mut [f64],
        arena: &mut MarkerPermutationArena,
        current_interaction: &mut String,
    ) -> Result<(), OutputError> {
        let interaction = row.get(ResultColumn::Interaction).unwrap_or("").to_string();
        if interaction != *current_interaction {
            if let (Some(writer), false) = (permutation_table.as_mut(), arena.is_empty()) {
                arena.flush(writer, current_interaction)?;
            }
            *current_interaction = interaction;
        }

        let permutation: usize = row
            .get(ResultColumn::Perm)
            .and_then(|cell| cell.parse().ok())
            .unwrap_or(0);
        if permutation >= minimum_ap.len() {
            warn!("Dropping row with out-of-range permutation index {}", permutation);
            return Ok(());
        }
        let marker = row.get(ResultColumn::Snp).unwrap_or("").to_string();

        let stable_additive = row.get(ResultColumn::StableAdditive) == Some(STABLE_YES);
        let stable_multiplicative =
            row.get(ResultColumn::StableMultiplicative) == Some(STABLE_YES);
        let ap_value = row
            .get(ResultColumn::Ap)
            .and_then(|cell| cell.parse::<f64>().ok());
        let suppress_negative_ap =
            !self.allow_negative_ap && ap_value.is_some_and(|value| value < 0.0);

        if stable_additive && !suppress_negative_ap {
            if let Some(value) = row
                .get(ResultColumn::ApPValue)
                .and_then(|cell| cell.parse::<f64>().ok())
            {
                minimum_ap[permutation] = minimum_ap[permutation].min(value);
            }
        }
        if stable_multiplicative {
            if let Some(value) = row
                .get(ResultColumn::MultPValue)
                .and_then(|cell| cell.parse::<f64>().ok())
            {
                minimum_mult[permutation] = minimum_mult[permutation].min(value);
            }
        }

        if permutation == 0 {
            writeln!(results, "{}", row.render())?;
            if self.permutations == 0 {
                return Ok(());
            }
            let threshold = row
                .get(ResultColumn::Threshold)
                .and_then(|cell| cell.parse::<f64>().ok())
                .unwrap_or(0.0);
            arena.open_baseline(&marker, &row, threshold);
            return Ok(());
        }

        if self.permutation_output {
            let writer = match raw_outputs.entry(permutation) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let path = self
                        .output_directory
                        .join(format!("results_permutation_{}.txt", permutation));
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    let mut writer = BufWriter::new(file);
                    writeln!(writer, "{}", ResultRow::header())?;
                    entry.insert(writer)
                }
            };
            writeln!(writer, "{}", row.render())?;
        }

        arena.record_permutation(
            &marker,
            &row,
            stable_additive,
            stable_multiplicative,
            suppress_negative_ap,
        );
        Ok(())
    }

    /// The max-T / min-p multiple-testing summary: for each cutoff, the
    /// fraction of permutations whose global minimum falls at or below it.
    fn write_summary_tables(
        &mut self,
        minimum_ap: &[f64],
        minimum_mult: &[f64],
    ) -> Result<(), OutputError> {
        if self.total_permutation_output {
            let mut writer = create_output_file(&self.output_directory, "total_permutations.txt")?;
            writeln!(writer, "APP\tMULT")?;
            for (ap, mult) in minimum_ap.iter().zip(minimum_mult.iter()) {
                writeln!(writer, "{}\t{}", ap, mult)?;
            }
            writer.flush()?;
        }

        // The unpermuted global minima join the configured cutoff lists.
        self.ap_limits.push(minimum_ap[0]);
        self.mult_limits.push(minimum_mult[0]);
        let ap_fractions = fraction_at_or_below(minimum_ap, &self.ap_limits);
        let mult_fractions = fraction_at_or_below(minimum_mult, &self.mult_limits);

        let mut writer =
            create_output_file(&self.output_directory, "total_permutation_results.txt")?;
        writeln!(writer, "{}", TOTAL_TABLE_COLUMNS.join("\t"))?;
        for index in 0..self.ap_limits.len().max(self.mult_limits.len()) {
            if index < self.ap_limits.len() {
                write!(writer, "{}\t{}\t", self.ap_limits[index], ap_fractions[index])?;
            } else {
                write!(writer, "\t\t")?;
            }
            if index < self.mult_limits.len() {
                write!(
                    writer,
                    "{}\t{}\t",
                    self.mult_limits[index], mult_fractions[index]
                )?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// For each cutoff, the fraction of permuted minima (indices 1..) at or
/// below it.
fn fraction_at_or_below(minima: &[f64], cutoffs: &[f64]) -> Vec<f64> {
    let permuted = &minima[1..];
    cutoffs
        .iter()
        .map(|&cutoff| {
            let below = permuted.iter().filter(|&&value| value <= cutoff).count();
            below as f64 / permuted.len() as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record_or(data: &mut PermutationData, value: f64) {
        data.record_permutation(
            Some(&value.to_string()),
            ResultColumn::OrBoth,
            true,
            true,
            false,
        );
    }

    #[test]
    fn odds_ratio_hits_follow_the_deviation_rule() {
        let mut data = PermutationData::default();
        data.record_baseline(Some("0.2"));
        for value in [0.05, 0.25, 0.5] {
            record_or(&mut data, value);
        }
        // Only 0.05 deviates from 1.0 at least as far as the baseline does.
        let p: f64 = data.p_value().parse().unwrap();
        assert_relative_eq!(p, 1.0 / 3.0);
    }

    #[test]
    fn missing_baseline_reports_na() {
        let mut data = PermutationData::default();
        record_or(&mut data, 0.5);
        assert_eq!(data.p_value(), NOT_AVAILABLE);
    }

    #[test]
    fn masked_comparisons_do_not_count() {
        let mut data = PermutationData::default();
        data.record_baseline(Some("0.01"));
        // Additive statistic, but every permuted fit failed to converge.
        for _ in 0..3 {
            data.record_permutation(Some("0.5"), ResultColumn::ApPValue, false, true, false);
        }
        assert_eq!(data.p_value(), NOT_AVAILABLE);
    }

    #[test]
    fn negative_ap_suppression_masks_only_the_ap_column() {
        let mut ap = PermutationData::default();
        let mut or = PermutationData::default();
        ap.record_baseline(Some("0.01"));
        or.record_baseline(Some("0.2"));
        ap.record_permutation(Some("0.001"), ResultColumn::ApPValue, true, true, true);
        or.record_permutation(Some("0.05"), ResultColumn::OrBoth, true, true, true);
        assert_eq!(ap.p_value(), NOT_AVAILABLE);
        assert_eq!(or.p_value(), "1");
    }

    #[test]
    fn stability_columns_count_converged_fits() {
        let mut data = PermutationData::default();
        data.record_baseline_value(1e-3);
        for cell in [STABLE_YES, "N", STABLE_YES, NOT_AVAILABLE] {
            data.record_permutation(
                Some(cell),
                ResultColumn::StableAdditive,
                false,
                false,
                false,
            );
        }
        assert_eq!(data.p_value(), "0.5");
    }

    #[test]
    fn p_value_columns_count_at_or_below_baseline() {
        let mut data = PermutationData::default();
        data.record_baseline(Some("0.05"));
        for value in [0.01, 0.05, 0.9] {
            data.record_permutation(
                Some(&value.to_string()),
                ResultColumn::MultPValue,
                true,
                true,
                false,
            );
        }
        let p: f64 = data.p_value().parse().unwrap();
        assert_relative_eq!(p, 2.0 / 3.0);
    }

    #[test]
    fn fractions_exclude_the_unpermuted_slot() {
        let minima = [0.001, 0.01, 0.2, 0.04];
        let fractions = fraction_at_or_below(&minima, &[0.05, 0.001]);
        assert_relative_eq!(fractions[0], 2.0 / 3.0);
        assert_relative_eq!(fractions[1], 0.0);
    }
}
