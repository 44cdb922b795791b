//! Maps a feature cluster's derived score vector to a single
//! probability-like value through binned empirical likelihood tables.
//!
//! The tables are a pure lookup: 30 mass bins spanning 800 Da to 30 kDa,
//! 1001 score bins over `[0, 1]` per dimension, one grid per score kind
//! and charge parity. Loading happens once at construction; empty or
//! misshapen tables are a fatal error since every later score would be
//! silently wrong.

use std::io::BufRead;

use thiserror::Error;

use crate::cluster::{ChargeParity, ScoreVector};

pub const MASS_BIN_COUNT: usize = 30;
pub const SCORE_BIN_COUNT: usize = 1001;
pub const MIN_SCORE_MASS: f64 = 800.0;
pub const MAX_SCORE_MASS: f64 = 30_000.0;

/// One dimension of the cluster score vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScoreKind {
    AbundanceRatio,
    BestDivergence,
    SummedDivergence,
    BestCorrelation,
    SummedCorrelation,
    BestIntensityRatio,
    SummedIntensityRatio,
    XicCorrelation,
}

impl ScoreKind {
    pub const ALL: [ScoreKind; 8] = [
        ScoreKind::AbundanceRatio,
        ScoreKind::BestDivergence,
        ScoreKind::SummedDivergence,
        ScoreKind::BestCorrelation,
        ScoreKind::SummedCorrelation,
        ScoreKind::BestIntensityRatio,
        ScoreKind::SummedIntensityRatio,
        ScoreKind::XicCorrelation,
    ];

    pub const COUNT: usize = Self::ALL.len();

    #[inline(always)]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Error)]
pub enum LikelihoodTableError {
    #[error("no likelihood table was provided for {kind:?}/{parity:?}")]
    Missing {
        kind: ScoreKind,
        parity: ChargeParity,
    },
    #[error("likelihood table for {kind:?} is empty")]
    Empty { kind: ScoreKind },
    #[error(
        "likelihood table for {kind:?} has {rows}x{cols} cells, expected {MASS_BIN_COUNT}x{SCORE_BIN_COUNT}"
    )]
    Shape {
        kind: ScoreKind,
        rows: usize,
        cols: usize,
    },
    #[error("unparseable likelihood value at row {row}, column {col}")]
    Parse { row: usize, col: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Grid = Box<[f64]>;

/// Incrementally assembles the per-dimension tables, then validates the
/// complete set.
#[derive(Debug)]
pub struct LikelihoodScorerBuilder {
    tables: Vec<Option<Grid>>,
    score_threshold: f64,
}

impl Default for LikelihoodScorerBuilder {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl LikelihoodScorerBuilder {
    pub fn new(score_threshold: f64) -> Self {
        let mut tables = Vec::with_capacity(ScoreKind::COUNT * 2);
        tables.resize_with(ScoreKind::COUNT * 2, || None);
        Self {
            tables,
            score_threshold,
        }
    }

    /// Install one grid of `MASS_BIN_COUNT` rows by `SCORE_BIN_COUNT`
    /// columns of log-likelihood ratios.
    pub fn set_table(
        &mut self,
        kind: ScoreKind,
        parity: ChargeParity,
        grid: Vec<Vec<f64>>,
    ) -> Result<&mut Self, LikelihoodTableError> {
        if grid.is_empty() {
            return Err(LikelihoodTableError::Empty { kind });
        }
        let cols = grid[0].len();
        if grid.len() != MASS_BIN_COUNT || cols != SCORE_BIN_COUNT {
            return Err(LikelihoodTableError::Shape {
                kind,
                rows: grid.len(),
                cols,
            });
        }
        let mut flat = Vec::with_capacity(MASS_BIN_COUNT * SCORE_BIN_COUNT);
        for row in grid.iter() {
            if row.len() != cols {
                return Err(LikelihoodTableError::Shape {
                    kind,
                    rows: grid.len(),
                    cols: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        self.tables[table_index(kind, parity)] = Some(flat.into_boxed_slice());
        Ok(self)
    }

    /// Parse one tab-separated numeric grid from a bundled resource.
    pub fn read_table<R: BufRead>(
        &mut self,
        kind: ScoreKind,
        parity: ChargeParity,
        reader: R,
    ) -> Result<&mut Self, LikelihoodTableError> {
        let mut grid = Vec::with_capacity(MASS_BIN_COUNT);
        for (row_i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut row = Vec::with_capacity(SCORE_BIN_COUNT);
            for (col_i, cell) in line.split('\t').enumerate() {
                let value: f64 = cell.trim().parse().map_err(|_| {
                    LikelihoodTableError::Parse {
                        row: row_i,
                        col: col_i,
                    }
                })?;
                row.push(value);
            }
            grid.push(row);
        }
        self.set_table(kind, parity, grid)
    }

    pub fn build(self) -> Result<LikelihoodScorer, LikelihoodTableError> {
        let mut tables = Vec::with_capacity(ScoreKind::COUNT * 2);
        for kind in ScoreKind::ALL {
            for parity in ChargeParity::BOTH {
                match &self.tables[table_index(kind, parity)] {
                    Some(grid) => tables.push(grid.clone()),
                    None => return Err(LikelihoodTableError::Missing { kind, parity }),
                }
            }
        }
        Ok(LikelihoodScorer {
            tables: tables.into_boxed_slice(),
            score_threshold: self.score_threshold,
        })
    }
}

/// The likelihood scorer itself: immutable tables plus the configured
/// acceptance threshold.
#[derive(Debug, Clone)]
pub struct LikelihoodScorer {
    tables: Box<[Grid]>,
    pub score_threshold: f64,
}

impl LikelihoodScorer {
    /// A scorer whose every table is zero, scoring every cluster at 0.
    /// Useful for tests and for running without trained tables.
    pub fn uniform(score_threshold: f64) -> Self {
        let grid: Grid = vec![0.0; MASS_BIN_COUNT * SCORE_BIN_COUNT].into_boxed_slice();
        let tables = vec![grid; ScoreKind::COUNT * 2].into_boxed_slice();
        Self {
            tables,
            score_threshold,
        }
    }

    pub fn builder(score_threshold: f64) -> LikelihoodScorerBuilder {
        LikelihoodScorerBuilder::new(score_threshold)
    }

    /// Sum the per-dimension log-likelihood ratios for a cluster's score
    /// vector at a given monoisotopic mass.
    pub fn score(&self, mass: f64, scores: &ScoreVector) -> f64 {
        let mass_bin = mass_bin(mass);
        let mut total = 0.0;
        for kind in ScoreKind::ALL {
            for parity in ChargeParity::BOTH {
                let value = scores.get(kind, parity);
                let grid = &self.tables[table_index(kind, parity)];
                total += grid[mass_bin * SCORE_BIN_COUNT + score_bin(value)];
            }
        }
        total
    }

    pub fn test_score(&self, score: f64) -> bool {
        score >= self.score_threshold
    }
}

#[inline(always)]
fn table_index(kind: ScoreKind, parity: ChargeParity) -> usize {
    kind.index() * 2 + parity.index()
}

#[inline(always)]
fn mass_bin(mass: f64) -> usize {
    let span = MAX_SCORE_MASS - MIN_SCORE_MASS;
    let frac = ((mass - MIN_SCORE_MASS) / span).clamp(0.0, 1.0);
    ((frac * MASS_BIN_COUNT as f64) as usize).min(MASS_BIN_COUNT - 1)
}

#[inline(always)]
fn score_bin(value: f64) -> usize {
    let clamped = if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else if value > 0.0 {
        1.0
    } else {
        0.0
    };
    (clamped * (SCORE_BIN_COUNT - 1) as f64).round() as usize
}
