// Per-marker model construction: allele tallies, risk-factor coding, design
// matrices, contingency counts and the derived interaction statistics.
//
// Everything here operates on task-local slices; nothing is shared between
// concurrently running tasks.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

use crate::types::{AffectionStatus, Allele, Genotype, ModelType, Sex};

/// Interaction-variable value marking a missing observation.
pub const MISSING_INTERACTION: i32 = -1;

/// Multiplicative design columns (before the intercept is prepended).
pub const MULT_RISK: usize = 0;
pub const MULT_INTERACTION: usize = 1;
pub const MULT_PRODUCT: usize = 2;
pub const MULT_FIXED_COLUMNS: usize = 3;

/// Additive design columns. The doubly-unexposed reference cell is kept as
/// the final column while counting and stripped before fitting.
pub const ADD_RISK_ONLY: usize = 0;
pub const ADD_INTERACTION_ONLY: usize = 1;
pub const ADD_BOTH: usize = 2;
pub const ADD_FIXED_COLUMNS: usize = 3;

/// Case/control allele frequencies and the derived risk/major/minor calls
/// for one marker, computed fresh per task.
#[derive(Debug, Clone)]
pub struct AlleleSummary {
    pub risk_allele: Allele,
    pub major_allele: Allele,
    pub minor_allele: Allele,
    pub case_major_ratio: f64,
    pub case_minor_ratio: f64,
    pub control_major_ratio: f64,
    pub control_minor_ratio: f64,
    pub major_ratio: f64,
    pub minor_ratio: f64,
}

impl AlleleSummary {
    pub fn is_risk(&self, allele: Allele) -> bool {
        self.risk_allele == allele
    }
}

/// Tallies primary/secondary allele counts in cases and controls (missing
/// genotypes and missing statuses are skipped) and derives the allele calls.
///
/// The risk allele is the shared major allele when its case frequency
/// exceeds its control frequency, otherwise the case-minor allele. Ties
/// resolve toward the primary allele.
pub fn allele_summary(
    genotypes: impl Iterator<Item = Genotype>,
    affection: &[AffectionStatus],
    primary: Allele,
    secondary: Allele,
) -> AlleleSummary {
    let mut control = [0i64; 2];
    let mut case = [0i64; 2];

    for (genotype, status) in genotypes.zip(affection.iter()) {
        let bucket = match status {
            AffectionStatus::Unaffected => &mut control,
            AffectionStatus::Affected => &mut case,
            AffectionStatus::Missing => continue,
        };
        match genotype {
            Genotype::HomozygotePrimary => bucket[0] += 2,
            Genotype::Heterozygote => {
                bucket[0] += 1;
                bucket[1] += 1;
            }
            Genotype::HomozygoteSecondary => bucket[1] += 2,
            Genotype::Missing => {}
        }
    }

    let control_total = (control[0] + control[1]) as f64;
    let case_total = (case[0] + case[1]) as f64;

    let (control_major_allele, control_major, control_minor) = if control[0] >= control[1] {
        (primary, control[0], control[1])
    } else {
        (secondary, control[1], control[0])
    };
    let (case_major_allele, case_minor_allele, case_major, case_minor) = if case[0] >= case[1] {
        (primary, secondary, case[0], case[1])
    } else {
        (secondary, primary, case[1], case[0])
    };

    let control_major_ratio = control_major as f64 / control_total;
    let control_minor_ratio = control_minor as f64 / control_total;
    let case_major_ratio = case_major as f64 / case_total;
    let case_minor_ratio = case_minor as f64 / case_total;

    let risk_allele = if case_major_ratio > control_major_ratio
        && case_major_allele == control_major_allele
    {
        case_major_allele
    } else {
        case_minor_allele
    };

    let primary_total = control[0] + case[0];
    let secondary_total = control[1] + case[1];
    let pooled_total = (primary_total + secondary_total) as f64;
    let (major_allele, minor_allele, major_count, minor_count) =
        if primary_total >= secondary_total {
            (primary, secondary, primary_total, secondary_total)
        } else {
            (secondary, primary, secondary_total, primary_total)
        };

    AlleleSummary {
        risk_allele,
        major_allele,
        minor_allele,
        case_major_ratio,
        case_minor_ratio,
        control_major_ratio,
        control_minor_ratio,
        major_ratio: major_count as f64 / pooled_total,
        minor_ratio: minor_count as f64 / pooled_total,
    }
}

/// Task-local rows that survived the missing-data reduction.
#[derive(Debug, Clone)]
pub struct ReducedData {
    pub genotypes: Vec<Genotype>,
    pub interactions: Vec<i32>,
    pub sexes: Vec<Sex>,
    pub affection: Vec<AffectionStatus>,
    /// One vector per kept row; empty when the run carries no covariates.
    pub covariates: Vec<Vec<f32>>,
}

impl ReducedData {
    pub fn len(&self) -> usize {
        self.genotypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genotypes.is_empty()
    }

    pub fn covariate_width(&self) -> usize {
        self.covariates.first().map_or(0, Vec::len)
    }
}

/// Drops every individual whose genotype, affection status or interaction
/// variable is missing. Covariate rows follow their individual.
pub fn reduce(
    genotypes: impl Iterator<Item = Genotype>,
    interactions: &[i32],
    sexes: &[Sex],
    affection: &[AffectionStatus],
    covariates: &[Vec<f32>],
) -> ReducedData {
    let mut reduced = ReducedData {
        genotypes: Vec::new(),
        interactions: Vec::new(),
        sexes: Vec::new(),
        affection: Vec::new(),
        covariates: Vec::new(),
    };

    for (index, genotype) in genotypes.enumerate() {
        if genotype.is_missing()
            || affection[index] == AffectionStatus::Missing
            || interactions[index] == MISSING_INTERACTION
        {
            continue;
        }
        reduced.genotypes.push(genotype);
        reduced.interactions.push(interactions[index]);
        reduced.sexes.push(sexes[index]);
        reduced.affection.push(affection[index]);
        if !covariates.is_empty() {
            reduced.covariates.push(covariates[index].clone());
        }
    }
    reduced
}

/// Which homozygote carries zero / two copies of the risk allele.
#[derive(Debug, Clone, Copy)]
pub struct RiskOrientation {
    pub zero_copies: Genotype,
    pub two_copies: Genotype,
}

pub fn orient_risk(risk_is_primary: bool) -> RiskOrientation {
    if risk_is_primary {
        RiskOrientation {
            zero_copies: Genotype::HomozygoteSecondary,
            two_copies: Genotype::HomozygotePrimary,
        }
    } else {
        RiskOrientation {
            zero_copies: Genotype::HomozygotePrimary,
            two_copies: Genotype::HomozygoteSecondary,
        }
    }
}

fn two_state_mapping(model: ModelType, chromosome: &str, sex: Sex) -> bool {
    model == ModelType::Dominant || (chromosome.eq_ignore_ascii_case("X") && sex == Sex::Male)
}

/// Classifies each row as risk-positive (1), risk-negative (0) or
/// unclassifiable (-1).
///
/// Under the dominant model, and for X-chromosome markers in males, the
/// heterozygote joins the risk side; under the recessive model only the
/// risk homozygote does. An odd `recode` inverts the mapping. The
/// interaction slice is passed separately because the recode correction may
/// swap it between passes.
pub fn classify_risk_factors(
    genotypes: &[Genotype],
    sexes: &[Sex],
    interactions: &[i32],
    model: ModelType,
    chromosome: &str,
    orientation: RiskOrientation,
    recode: u8,
) -> Vec<i32> {
    let uneven = recode % 2 == 1;

    genotypes
        .iter()
        .zip(sexes.iter())
        .zip(interactions.iter())
        .map(|((&genotype, &sex), &interaction)| {
            if interaction == MISSING_INTERACTION {
                return -1;
            }
            if genotype.is_missing() {
                return -1;
            }
            let two_state = two_state_mapping(model, chromosome, sex);
            let risk_positive = match (two_state, uneven) {
                (true, false) => genotype != orientation.zero_copies,
                (true, true) => genotype == orientation.zero_copies,
                (false, false) => genotype == orientation.two_copies,
                (false, true) => genotype != orientation.two_copies,
            };
            i32::from(risk_positive)
        })
        .collect()
}

/// Inverts the interaction indicator: 0 becomes 1, anything positive becomes
/// 0, missing stays missing.
pub fn swap_interactions(interactions: &[i32]) -> Vec<i32> {
    interactions
        .iter()
        .map(|&value| match value {
            MISSING_INTERACTION => MISSING_INTERACTION,
            0 => 1,
            _ => 0,
        })
        .collect()
}

/// Case/control counts over the four risk x interaction cells.
/// Layout: `counts[risk][interaction][status]` with status 0 = control.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContingencyCube {
    counts: [[[i64; 2]; 2]; 2],
}

impl ContingencyCube {
    pub fn count(&self, risk: usize, interaction: usize, status: usize) -> i64 {
        self.counts[risk][interaction][status]
    }

    /// The cutoff gate: true when any of the eight cells is at or below the
    /// configured minimum.
    pub fn has_sparse_cell(&self, cutoff: i64) -> bool {
        self.counts
            .iter()
            .flatten()
            .flatten()
            .any(|&count| count <= cutoff)
    }
}

/// Both design matrices plus the shared response vector for one task.
#[derive(Debug, Clone)]
pub struct DesignMatrices {
    /// rows x (3 + covariates): risk, interaction, product, covariates.
    pub multiplicative: DMatrix<f64>,
    /// rows x (4 + covariates): three exposure cells, covariates, and the
    /// reference cell as the trailing column.
    pub additive: DMatrix<f64>,
    pub response: DVector<f64>,
}

impl DesignMatrices {
    /// Allocates NaN-initialized matrices and fills the covariate columns
    /// and the response; the indicator columns are populated per recode pass
    /// by [`fill_indicators`].
    pub fn new(reduced: &ReducedData) -> DesignMatrices {
        let rows = reduced.len();
        let width = reduced.covariate_width();

        let mut multiplicative = DMatrix::from_element(rows, MULT_FIXED_COLUMNS + width, f64::NAN);
        let mut additive = DMatrix::from_element(rows, ADD_FIXED_COLUMNS + width + 1, f64::NAN);

        for (row, covariates) in reduced.covariates.iter().enumerate() {
            for (offset, &value) in covariates.iter().enumerate() {
                multiplicative[(row, MULT_FIXED_COLUMNS + offset)] = f64::from(value);
                additive[(row, ADD_FIXED_COLUMNS + offset)] = f64::from(value);
            }
        }

        let response = DVector::from_iterator(
            rows,
            reduced
                .affection
                .iter()
                .map(|status| status.response().unwrap_or(f64::NAN)),
        );

        DesignMatrices {
            multiplicative,
            additive,
            response,
        }
    }

    /// The column index of the additive reference cell (always last).
    pub fn reference_column(&self) -> usize {
        self.additive.ncols() - 1
    }
}

/// (Re)populates the indicator columns of both matrices from the current
/// risk coding and returns the contingency cube counted over the same rows.
/// Rows with an unclassifiable risk factor keep NaN indicators and are
/// dropped by [`clean_rows`] before fitting.
pub fn fill_indicators(
    design: &mut DesignMatrices,
    risk_factors: &[i32],
    interactions: &[i32],
    affection: &[AffectionStatus],
) -> ContingencyCube {
    let reference = design.reference_column();
    for row in 0..design.additive.nrows() {
        for column in [ADD_RISK_ONLY, ADD_INTERACTION_ONLY, ADD_BOTH, reference] {
            design.additive[(row, column)] = f64::NAN;
        }
        for column in [MULT_RISK, MULT_INTERACTION, MULT_PRODUCT] {
            design.multiplicative[(row, column)] = f64::NAN;
        }
    }

    let mut cube = ContingencyCube::default();
    for (row, &risk) in risk_factors.iter().enumerate() {
        if risk == -1 {
            continue;
        }
        let interaction_positive = interactions[row] >= 1;
        let status = match affection[row] {
            AffectionStatus::Unaffected => 0,
            AffectionStatus::Affected => 1,
            AffectionStatus::Missing => continue,
        };
        cube.counts[risk as usize][usize::from(interaction_positive)][status] += 1;

        let cell = |target_risk: i32, target_interaction: bool| -> f64 {
            if risk == target_risk && interaction_positive == target_interaction {
                1.0
            } else {
                0.0
            }
        };
        design.additive[(row, reference)] = cell(0, false);
        design.additive[(row, ADD_RISK_ONLY)] = cell(1, false);
        design.additive[(row, ADD_INTERACTION_ONLY)] = cell(0, true);
        design.additive[(row, ADD_BOTH)] = cell(1, true);

        design.multiplicative[(row, MULT_RISK)] = if risk == 1 { 1.0 } else { 0.0 };
        design.multiplicative[(row, MULT_INTERACTION)] =
            if interaction_positive { 1.0 } else { 0.0 };
        design.multiplicative[(row, MULT_PRODUCT)] = design.multiplicative[(row, MULT_RISK)]
            * design.multiplicative[(row, MULT_INTERACTION)];
    }
    cube
}

/// Removes every row containing an undefined cell, pairing the response with
/// the surviving rows.
pub fn clean_rows(matrix: &DMatrix<f64>, response: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let keep: Vec<usize> = (0..matrix.nrows())
        .filter(|&row| {
            !response[row].is_nan() && (0..matrix.ncols()).all(|col| !matrix[(row, col)].is_nan())
        })
        .collect();

    let cleaned = DMatrix::from_fn(keep.len(), matrix.ncols(), |row, col| {
        matrix[(keep[row], col)]
    });
    let kept_response = DVector::from_iterator(keep.len(), keep.iter().map(|&row| response[row]));
    (cleaned, kept_response)
}

/// All columns except the trailing reference cell.
pub fn strip_reference_column(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    matrix.columns(0, matrix.ncols() - 1).into_owned()
}

/// Odds ratio with its 95% confidence bounds.
#[derive(Debug, Clone, Copy)]
pub struct OddsRatio {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

pub fn odds_ratio(beta: f64, standard_error: f64) -> OddsRatio {
    OddsRatio {
        value: beta.exp(),
        lower: (beta - 1.96 * standard_error).exp(),
        upper: (beta + 1.96 * standard_error).exp(),
    }
}

/// Two-sided p-value for the multiplicative interaction term: the square of
/// its z statistic referred to a one-degree chi-squared distribution.
pub fn multiplicative_p_value(z: f64) -> f64 {
    let chi = ChiSquared::new(1.0).expect("chi-squared with one degree of freedom");
    1.0 - chi.cdf(z * z)
}

/// Attributable proportion due to interaction with its delta-method
/// confidence interval and p-value.
#[derive(Debug, Clone, Copy)]
pub struct ApStatistics {
    pub reri: f64,
    pub ap: f64,
    pub lower: f64,
    pub upper: f64,
    pub p_value: f64,
}

/// Derives RERI and AP from the additive fit. `risk_only`, `interaction_only`
/// and `both` are coefficient indices (intercept included) into `beta`.
pub fn ap_statistics(
    beta: &DVector<f64>,
    covariance: &DMatrix<f64>,
    risk_only: usize,
    interaction_only: usize,
    both: usize,
) -> ApStatistics {
    let or_risk_only = beta[risk_only].exp();
    let or_interaction_only = beta[interaction_only].exp();
    let or_both = beta[both].exp();

    let reri = or_both - or_risk_only - or_interaction_only + 1.0;

    // Partial derivatives of AP with respect to the three cell coefficients.
    let h1 = -(beta[risk_only] - beta[both]).exp();
    let h2 = -(beta[interaction_only] - beta[both]).exp();
    let h3 = (or_interaction_only + or_risk_only - 1.0) / or_both;

    let variance = h1 * h1 * covariance[(risk_only, risk_only)]
        + h2 * h2 * covariance[(interaction_only, interaction_only)]
        + h3 * h3 * covariance[(both, both)]
        + 2.0 * h1 * h2 * covariance[(risk_only, interaction_only)]
        + 2.0 * h1 * h3 * covariance[(interaction_only, both)]
        + 2.0 * h2 * h3 * covariance[(risk_only, both)];
    let standard_error = variance.sqrt();

    let ap = reri / or_both;
    let p_value = if standard_error.is_finite() && standard_error > 0.0 {
        let normal = Normal::new(0.0, standard_error).expect("normal with positive deviation");
        2.0 * (1.0 - normal.cdf(ap.abs()))
    } else {
        f64::NAN
    };

    ApStatistics {
        reri,
        ap,
        lower: ap - 1.96 * standard_error,
        upper: ap + 1.96 * standard_error,
        p_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn affected(n: usize) -> Vec<AffectionStatus> {
        vec![AffectionStatus::Affected; n]
    }

    #[test]
    fn risk_allele_follows_case_enrichment() {
        // Cases carry 8 copies of the primary allele, controls 2; the major
        // allele is the primary in both groups.
        let genotypes = vec![
            Genotype::HomozygotePrimary,
            Genotype::HomozygotePrimary,
            Genotype::HomozygotePrimary,
            Genotype::HomozygotePrimary,
            Genotype::HomozygotePrimary,
            Genotype::HomozygoteSecondary,
        ];
        let affection = vec![
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Unaffected,
            AffectionStatus::Unaffected,
        ];
        let summary = allele_summary(
            genotypes.into_iter(),
            &affection,
            Allele::A,
            Allele::C,
        );
        assert_eq!(summary.risk_allele, Allele::A);
        assert_eq!(summary.major_allele, Allele::A);
        assert_eq!(summary.minor_allele, Allele::C);
        assert_relative_eq!(summary.case_major_ratio, 1.0);
        assert_relative_eq!(summary.control_major_ratio, 0.5);
    }

    #[test]
    fn case_minor_allele_wins_when_majors_differ() {
        // Cases are enriched for the secondary allele; the groups disagree on
        // the major allele, so the risk call falls to the case minor.
        let genotypes = vec![
            Genotype::HomozygoteSecondary,
            Genotype::HomozygoteSecondary,
            Genotype::HomozygotePrimary,
            Genotype::HomozygotePrimary,
        ];
        let affection = vec![
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Unaffected,
            AffectionStatus::Unaffected,
        ];
        let summary = allele_summary(genotypes.into_iter(), &affection, Allele::A, Allele::C);
        assert_eq!(summary.risk_allele, Allele::A);
    }

    #[test]
    fn reduction_drops_incomplete_rows() {
        let genotypes = vec![
            Genotype::Heterozygote,
            Genotype::Missing,
            Genotype::Heterozygote,
            Genotype::HomozygotePrimary,
        ];
        let interactions = vec![1, 1, MISSING_INTERACTION, 0];
        let sexes = vec![Sex::Female; 4];
        let affection = vec![
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Affected,
            AffectionStatus::Missing,
        ];
        let reduced = reduce(genotypes.into_iter(), &interactions, &sexes, &affection, &[]);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced.genotypes, vec![Genotype::Heterozygote]);
    }

    #[test]
    fn dominant_model_counts_heterozygote_as_risk() {
        let reduced = ReducedData {
            genotypes: vec![
                Genotype::HomozygotePrimary,
                Genotype::Heterozygote,
                Genotype::HomozygoteSecondary,
            ],
            interactions: vec![0, 0, 0],
            sexes: vec![Sex::Female; 3],
            affection: affected(3),
            covariates: Vec::new(),
        };
        let orientation = orient_risk(true);
        let factors = classify_risk_factors(
            &reduced.genotypes,
            &reduced.sexes,
            &reduced.interactions,
            ModelType::Dominant,
            "1",
            orientation,
            0,
        );
        assert_eq!(factors, vec![1, 1, 0]);
    }

    #[test]
    fn recessive_model_requires_two_copies() {
        let reduced = ReducedData {
            genotypes: vec![
                Genotype::HomozygotePrimary,
                Genotype::Heterozygote,
                Genotype::HomozygoteSecondary,
            ],
            interactions: vec![0, 0, 0],
            sexes: vec![Sex::Female; 3],
            affection: affected(3),
            covariates: Vec::new(),
        };
        let orientation = orient_risk(true);
        let factors = classify_risk_factors(
            &reduced.genotypes,
            &reduced.sexes,
            &reduced.interactions,
            ModelType::Recessive,
            "1",
            orientation,
            0,
        );
        assert_eq!(factors, vec![1, 0, 0]);
    }

    #[test]
    fn x_chromosome_males_use_the_dominant_mapping() {
        let reduced = ReducedData {
            genotypes: vec![Genotype::Heterozygote, Genotype::Heterozygote],
            interactions: vec![0, 0],
            sexes: vec![Sex::Male, Sex::Female],
            affection: affected(2),
            covariates: Vec::new(),
        };
        let orientation = orient_risk(true);
        let factors = classify_risk_factors(
            &reduced.genotypes,
            &reduced.sexes,
            &reduced.interactions,
            ModelType::Recessive,
            "X",
            orientation,
            0,
        );
        assert_eq!(factors, vec![1, 0]);
    }

    #[test]
    fn odd_recode_inverts_the_mapping() {
        let reduced = ReducedData {
            genotypes: vec![
                Genotype::HomozygotePrimary,
                Genotype::Heterozygote,
                Genotype::HomozygoteSecondary,
            ],
            interactions: vec![0, 0, 0],
            sexes: vec![Sex::Female; 3],
            affection: affected(3),
            covariates: Vec::new(),
        };
        let orientation = orient_risk(true);
        let factors = classify_risk_factors(
            &reduced.genotypes,
            &reduced.sexes,
            &reduced.interactions,
            ModelType::Dominant,
            "1",
            orientation,
            1,
        );
        assert_eq!(factors, vec![0, 0, 1]);
    }

    #[test]
    fn swap_interactions_inverts_and_keeps_missing() {
        assert_eq!(swap_interactions(&[-1, 0, 1, 3]), vec![-1, 1, 0, 0]);
    }

    #[test]
    fn indicators_and_cube_agree() {
        let reduced = ReducedData {
            genotypes: vec![Genotype::Heterozygote; 4],
            interactions: vec![0, 1, 0, 1],
            sexes: vec![Sex::Female; 4],
            affection: vec![
                AffectionStatus::Unaffected,
                AffectionStatus::Unaffected,
                AffectionStatus::Affected,
                AffectionStatus::Affected,
            ],
            covariates: Vec::new(),
        };
        let mut design = DesignMatrices::new(&reduced);
        let risk = vec![0, 1, 1, 0];
        let cube = fill_indicators(&mut design, &risk, &reduced.interactions, &reduced.affection);

        assert_eq!(cube.count(0, 0, 0), 1);
        assert_eq!(cube.count(1, 1, 0), 1);
        assert_eq!(cube.count(1, 0, 1), 1);
        assert_eq!(cube.count(0, 1, 1), 1);
        assert!(cube.has_sparse_cell(0));

        // Row 1: risk=1, interaction=1 -> the doubly-exposed additive cell.
        assert_relative_eq!(design.additive[(1, ADD_BOTH)], 1.0);
        assert_relative_eq!(design.additive[(1, ADD_RISK_ONLY)], 0.0);
        assert_relative_eq!(design.multiplicative[(1, MULT_PRODUCT)], 1.0);
        // Row 0: reference cell.
        assert_relative_eq!(design.additive[(0, design.reference_column())], 1.0);
    }

    #[test]
    fn clean_rows_drops_nan_rows() {
        let matrix = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, f64::NAN, 1.0, 0.0, 1.0]);
        let response = DVector::from_vec(vec![1.0, 0.0, 1.0]);
        let (cleaned, kept) = clean_rows(&matrix, &response);
        assert_eq!(cleaned.nrows(), 2);
        assert_eq!(kept.len(), 2);
        assert_relative_eq!(cleaned[(1, 1)], 1.0);
    }

    #[test]
    fn multiplicative_p_value_matches_normal_tail() {
        // z = 1.96 corresponds to the familiar two-sided 5% level.
        assert_relative_eq!(multiplicative_p_value(1.96), 0.05, epsilon = 1e-3);
        assert_relative_eq!(multiplicative_p_value(0.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn ap_is_zero_for_purely_multiplicative_effects() {
        // With beta_io = beta_oi and beta_ii = ln(exp(b_io) + exp(b_oi) - 1),
        // RERI is exactly zero.
        let b = 0.5f64;
        let b_both = (2.0 * b.exp() - 1.0).ln();
        let beta = DVector::from_vec(vec![0.0, b, b, b_both]);
        let covariance = DMatrix::identity(4, 4);
        let stats = ap_statistics(&beta, &covariance, 1, 2, 3);
        assert_relative_eq!(stats.reri, 0.0, epsilon = 1e-12);
        assert_relative_eq!(stats.ap, 0.0, epsilon = 1e-12);
        assert!(stats.p_value > 0.9);
    }
}
