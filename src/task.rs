// The atomic unit of work: one marker, one permutation. A batch of task
// configurations is what gets submitted to the worker pool; each marker in
// the batch produces its own result row or its own error.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::stats::logistic::{self, FitError, FitOptions};
use crate::stats::model::{
    self, ap_statistics, classify_risk_factors, fill_indicators, odds_ratio, DesignMatrices,
    ADD_BOTH, ADD_INTERACTION_ONLY, ADD_RISK_ONLY, MULT_INTERACTION, MULT_PRODUCT, MULT_RISK,
};
use crate::store::MarkerRow;
use crate::types::{AffectionStatus, Allele, ModelType, Sex};

/// Rendered value of a converged fit flag.
pub const STABLE_YES: &str = "Y";
/// Rendered value of a non-converged fit flag.
pub const STABLE_NO: &str = "N";
/// Rendered value for statistics that were never computed.
pub const NOT_AVAILABLE: &str = "NA";
/// Rendered value for statistics suppressed by the sparse-cell cutoff.
pub const SUPPRESSED: &str = "0.0";

/// Broad class of a statistic, used by the aggregator to decide which
/// stability flag masks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatClass {
    Additive,
    Multiplicative,
    Other,
}

macro_rules! result_columns {
    ($(($variant:ident, $key:literal, $class:ident)),+ $(,)?) => {
        /// The closed set of output columns.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultColumn {
            $($variant),+
        }

        impl ResultColumn {
            pub const ALL: &'static [ResultColumn] = &[$(ResultColumn::$variant),+];

            /// The header key this column renders as.
            pub fn key(self) -> &'static str {
                match self {
                    $(ResultColumn::$variant => $key),+
                }
            }

            pub fn class(self) -> StatClass {
                match self {
                    $(ResultColumn::$variant => StatClass::$class),+
                }
            }
        }
    };
}

// Declaration order is the output column order. `Perm` and `Threshold` are
// carried per row for the aggregator's bookkeeping but never printed.
result_columns! {
    (Perm, "perm", Other),
    (Interaction, "Interaction_marker", Other),
    (Chr, "Chr_test_marker", Other),
    (Snp, "Test_marker", Other),
    (OrBoth, "ORa_double_exposure", Additive),
    (OrBothLower, "ORa_double_exposure_lower_limit", Additive),
    (OrBothUpper, "ORa_double_exposure_higher_limit", Additive),
    (OrTest, "ORa_test_marker", Additive),
    (OrTestLower, "ORa_test_marker_lower_limit", Additive),
    (OrTestUpper, "ORa_test_marker_higher_limit", Additive),
    (OrRisk, "ORa_risk_factor", Additive),
    (OrRiskLower, "ORa_risk_factor_lower_limit", Additive),
    (OrRiskUpper, "ORa_risk_factor_higher_limit", Additive),
    (Ap, "AP", Additive),
    (ApLower, "AP_L", Additive),
    (ApUpper, "AP_H", Additive),
    (ApPValue, "AP_pvalue", Additive),
    (StableAdditive, "Stable_additive_logistic_regression", Other),
    (MultPValue, "Multiplicative_interaction_term_pvalue", Multiplicative),
    (OrmInteraction, "ORm_interaction", Multiplicative),
    (OrmInteractionLower, "ORm_interaction_L", Multiplicative),
    (OrmInteractionUpper, "ORm_interaction_H", Multiplicative),
    (OrmTest, "ORm_testmarker", Multiplicative),
    (OrmTestLower, "ORm_testmarker_L", Multiplicative),
    (OrmTestUpper, "ORm_testmarker_H", Multiplicative),
    (OrmRisk, "ORm_riskfactor", Multiplicative),
    (OrmRiskLower, "ORm_riskfactor_L", Multiplicative),
    (OrmRiskUpper, "ORm_riskfactor_H", Multiplicative),
    (StableMultiplicative, "Stable_multiplicative_logistic_regression", Other),
    (ControlsTest0Risk0, "No_controls_test_0_risk_0", Other),
    (CasesTest0Risk0, "No_cases_test_0_risk_0", Other),
    (CasesTest1Risk0, "No_cases_test_1_risk_0", Other),
    (ControlsTest1Risk0, "No_controls_test_1_risk_0", Other),
    (CasesTest0Risk1, "No_cases_test_0_risk_1", Other),
    (ControlsTest0Risk1, "No_controls_test_0_risk_1", Other),
    (CasesTest1Risk1, "No_cases_test_1_risk_1", Other),
    (ControlsTest1Risk1, "No_controls_test_1_risk_1", Other),
    (MinorAllele, "Test_marker_minor_allele", Other),
    (MajorAllele, "Test_marker_major_allele", Other),
    (RiskAllele, "Test_marker_risk_allele", Other),
    (Recode, "recode_code", Other),
    (Threshold, "convergence_threshold", Other),
}

impl ResultColumn {
    /// Columns written to the results tables, in order.
    pub fn printed() -> impl Iterator<Item = ResultColumn> {
        ResultColumn::ALL
            .iter()
            .copied()
            .filter(|column| !matches!(column, ResultColumn::Perm | ResultColumn::Threshold))
    }
}

/// One finished row: the closed column set mapped to rendered values.
#[derive(Debug, Clone, Default)]
pub struct ResultRow {
    values: HashMap<ResultColumn, String>,
}

impl ResultRow {
    pub fn set(&mut self, column: ResultColumn, value: impl Into<String>) {
        self.values.insert(column, value.into());
    }

    pub fn get(&self, column: ResultColumn) -> Option<&str> {
        self.values.get(&column).map(String::as_str)
    }

    /// Renders the printable columns as one tab-separated line.
    pub fn render(&self) -> String {
        let mut line = String::new();
        for column in ResultColumn::printed() {
            if !line.is_empty() {
                line.push('\t');
            }
            line.push_str(self.get(column).unwrap_or(NOT_AVAILABLE));
        }
        line
    }

    /// The matching tab-separated header line.
    pub fn header() -> String {
        let mut line = String::new();
        for column in ResultColumn::printed() {
            if !line.is_empty() {
                line.push('\t');
            }
            line.push_str(column.key());
        }
        line
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("marker {marker} (permutation {permutation}): {source}")]
    Fit {
        marker: String,
        permutation: usize,
        source: FitError,
    },
}

/// Immutable input bundle for one (marker, permutation) computation. Shared
/// sequences are reference-counted; the per-round affection assignment is a
/// snapshot taken at submission time.
#[derive(Clone)]
pub struct TaskConfig {
    pub chromosome: String,
    pub marker: String,
    pub interaction_marker: Arc<str>,
    pub genotypes: MarkerRow,
    pub sexes: Arc<Vec<Sex>>,
    pub affection: Arc<Vec<AffectionStatus>>,
    pub interactions: Arc<Vec<i32>>,
    pub covariates: Arc<Vec<Vec<f32>>>,
    pub primary_allele: Allele,
    pub secondary_allele: Allele,
    pub permutation: usize,
    pub cell_cutoff: i64,
    pub model_type: ModelType,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
}

/// Outcome of one marker within a batch.
pub type TaskOutcome = Result<ResultRow, TaskError>;

/// Runs every configuration in a batch. A failing marker yields an error
/// outcome; it never takes the rest of the batch down with it.
pub fn run_batch(configs: Vec<TaskConfig>) -> Vec<TaskOutcome> {
    configs.into_iter().map(analyze_marker).collect()
}

// Coefficient index of a design column once the intercept is prepended.
#[inline]
fn coefficient(column: usize) -> usize {
    column + 1
}

fn set_odds_ratio_columns(
    row: &mut ResultRow,
    fit: &logistic::LogisticFit,
    column: usize,
    targets: [ResultColumn; 3],
) {
    let index = coefficient(column);
    let or = odds_ratio(fit.beta[index], fit.standard_error[index]);
    row.set(targets[0], or.value.to_string());
    row.set(targets[1], or.lower.to_string());
    row.set(targets[2], or.upper.to_string());
}

fn fit_error(config: &TaskConfig) -> impl FnOnce(FitError) -> TaskError + '_ {
    move |source| TaskError::Fit {
        marker: config.marker.clone(),
        permutation: config.permutation,
        source,
    }
}

/// The per-marker state machine:
/// classify -> design -> fit-multiplicative -> fit-additive -> recode? ->
/// finalize. The corrective recode pass happens at most once.
pub fn analyze_marker(config: TaskConfig) -> TaskOutcome {
    let mut row = ResultRow::default();
    row.set(ResultColumn::Perm, config.permutation.to_string());
    row.set(ResultColumn::Interaction, config.interaction_marker.as_ref());
    row.set(ResultColumn::Chr, config.chromosome.clone());
    row.set(ResultColumn::Snp, config.marker.clone());

    // Allele calls come from the full sequences; the model rows come from
    // the reduction below.
    let summary = model::allele_summary(
        config.genotypes.iter(),
        &config.affection,
        config.primary_allele,
        config.secondary_allele,
    );
    row.set(ResultColumn::RiskAllele, summary.risk_allele.to_string());
    row.set(ResultColumn::MajorAllele, summary.major_allele.to_string());
    row.set(ResultColumn::MinorAllele, summary.minor_allele.to_string());

    let reduced = model::reduce(
        config.genotypes.iter(),
        &config.interactions,
        &config.sexes,
        &config.affection,
        &config.covariates,
    );
    let orientation = model::orient_risk(summary.is_risk(config.primary_allele));

    let mut recode: u8 = 0;
    let mut interactions = reduced.interactions.clone();
    let mut risk_factors = classify_risk_factors(
        &reduced.genotypes,
        &reduced.sexes,
        &interactions,
        config.model_type,
        &config.chromosome,
        orientation,
        recode,
    );

    let mut design = DesignMatrices::new(&reduced);
    let mut cube = fill_indicators(&mut design, &risk_factors, &interactions, &reduced.affection);

    let options = FitOptions {
        max_iterations: config.max_iterations,
        convergence_threshold: config.convergence_threshold,
    };

    // Initial additive fit on the recode-0 design; its coefficients drive
    // the recode decision regardless of the cutoff gate.
    let initial_fit = {
        let (cleaned, response) = model::clean_rows(&design.additive, &design.response);
        let stripped = model::strip_reference_column(&cleaned);
        logistic::fit(&stripped.transpose(), &response, options).map_err(fit_error(&config))?
    };

    // Multiplicative model, always on the recode-0 classification.
    if cube.has_sparse_cell(config.cell_cutoff) {
        for column in [
            ResultColumn::MultPValue,
            ResultColumn::OrmInteraction,
            ResultColumn::OrmInteractionLower,
            ResultColumn::OrmInteractionUpper,
            ResultColumn::OrmTest,
            ResultColumn::OrmTestLower,
            ResultColumn::OrmTestUpper,
            ResultColumn::OrmRisk,
            ResultColumn::OrmRiskLower,
            ResultColumn::OrmRiskUpper,
        ] {
            row.set(column, SUPPRESSED);
        }
        row.set(ResultColumn::StableMultiplicative, NOT_AVAILABLE);
    } else {
        let (cleaned, response) = model::clean_rows(&design.multiplicative, &design.response);
        let fit = logistic::fit(&cleaned.transpose(), &response, options)
            .map_err(fit_error(&config))?;
        row.set(
            ResultColumn::StableMultiplicative,
            if fit.stable { STABLE_YES } else { STABLE_NO },
        );
        let z = fit.z[coefficient(MULT_PRODUCT)];
        row.set(
            ResultColumn::MultPValue,
            model::multiplicative_p_value(z).to_string(),
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            MULT_RISK,
            [
                ResultColumn::OrmTest,
                ResultColumn::OrmTestLower,
                ResultColumn::OrmTestUpper,
            ],
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            MULT_INTERACTION,
            [
                ResultColumn::OrmRisk,
                ResultColumn::OrmRiskLower,
                ResultColumn::OrmRiskUpper,
            ],
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            MULT_PRODUCT,
            [
                ResultColumn::OrmInteraction,
                ResultColumn::OrmInteractionLower,
                ResultColumn::OrmInteractionUpper,
            ],
        );
    }

    // Corrective recode: a strictly smallest negative cell coefficient
    // reorients the risk coding; one pass only.
    let c_risk_only = initial_fit.beta[coefficient(ADD_RISK_ONLY)];
    let c_interaction_only = initial_fit.beta[coefficient(ADD_INTERACTION_ONLY)];
    let c_both = initial_fit.beta[coefficient(ADD_BOTH)];

    if c_risk_only < 0.0 && c_risk_only < c_interaction_only && c_risk_only < c_both {
        recode = 1;
    } else if c_interaction_only < 0.0
        && c_interaction_only < c_risk_only
        && c_interaction_only < c_both
    {
        recode = 2;
        interactions = model::swap_interactions(&interactions);
    } else if c_both < 0.0 && c_both < c_risk_only && c_both < c_interaction_only {
        recode = 3;
        interactions = model::swap_interactions(&interactions);
    }
    if recode != 0 {
        risk_factors = classify_risk_factors(
            &reduced.genotypes,
            &reduced.sexes,
            &interactions,
            config.model_type,
            &config.chromosome,
            orientation,
            recode,
        );
        cube = fill_indicators(&mut design, &risk_factors, &interactions, &reduced.affection);
    }

    row.set(ResultColumn::CasesTest0Risk0, cube.count(0, 0, 1).to_string());
    row.set(ResultColumn::ControlsTest0Risk0, cube.count(0, 0, 0).to_string());
    row.set(ResultColumn::CasesTest1Risk0, cube.count(1, 0, 1).to_string());
    row.set(ResultColumn::ControlsTest1Risk0, cube.count(1, 0, 0).to_string());
    row.set(ResultColumn::CasesTest0Risk1, cube.count(0, 1, 1).to_string());
    row.set(ResultColumn::ControlsTest0Risk1, cube.count(0, 1, 0).to_string());
    row.set(ResultColumn::CasesTest1Risk1, cube.count(1, 1, 1).to_string());
    row.set(ResultColumn::ControlsTest1Risk1, cube.count(1, 1, 0).to_string());
    row.set(ResultColumn::Recode, recode.to_string());
    row.set(
        ResultColumn::Threshold,
        config.convergence_threshold.to_string(),
    );

    // Additive model on the (possibly recoded) classification.
    if cube.has_sparse_cell(config.cell_cutoff) {
        for column in [
            ResultColumn::OrTest,
            ResultColumn::OrTestLower,
            ResultColumn::OrTestUpper,
            ResultColumn::OrBoth,
            ResultColumn::OrBothLower,
            ResultColumn::OrBothUpper,
            ResultColumn::OrRisk,
            ResultColumn::OrRiskLower,
            ResultColumn::OrRiskUpper,
            ResultColumn::Ap,
            ResultColumn::ApLower,
            ResultColumn::ApUpper,
            ResultColumn::ApPValue,
        ] {
            row.set(column, SUPPRESSED);
        }
        row.set(ResultColumn::StableAdditive, NOT_AVAILABLE);
    } else {
        let (cleaned, response) = model::clean_rows(&design.additive, &design.response);
        let stripped = model::strip_reference_column(&cleaned);
        let fit = logistic::fit(&stripped.transpose(), &response, options)
            .map_err(fit_error(&config))?;
        row.set(
            ResultColumn::StableAdditive,
            if fit.stable { STABLE_YES } else { STABLE_NO },
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            ADD_RISK_ONLY,
            [
                ResultColumn::OrTest,
                ResultColumn::OrTestLower,
                ResultColumn::OrTestUpper,
            ],
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            ADD_BOTH,
            [
                ResultColumn::OrBoth,
                ResultColumn::OrBothLower,
                ResultColumn::OrBothUpper,
            ],
        );
        set_odds_ratio_columns(
            &mut row,
            &fit,
            ADD_INTERACTION_ONLY,
            [
                ResultColumn::OrRisk,
                ResultColumn::OrRiskLower,
                ResultColumn::OrRiskUpper,
            ],
        );

        let ap = ap_statistics(
            &fit.beta,
            &fit.covariance,
            coefficient(ADD_RISK_ONLY),
            coefficient(ADD_INTERACTION_ONLY),
            coefficient(ADD_BOTH),
        );
        row.set(ResultColumn::Ap, ap.ap.to_string());
        row.set(ResultColumn::ApLower, ap.lower.to_string());
        row.set(ResultColumn::ApUpper, ap.upper.to_string());
        row.set(ResultColumn::ApPValue, ap.p_value.to_string());
    }

    Ok(row)
}
