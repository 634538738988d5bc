//! Cross-subject projection onto two principal axes.
//!
//! Cached utility vectors that share one item set are stacked into a
//! subjects x items matrix and reduced with PCA. Subjects are ordered by key
//! before anything else happens, so the same cache always yields the same
//! axes, up to the sign of each axis. PCA does not fix those signs; the
//! convention applied here only makes them repeatable.
//!
//! Pipeline:
//! 1. Drop subjects with another fingerprint, a different item count, or more
//!    missing items than `max_missing_fraction`, recording why.
//! 2. Optionally z-score each subject's present utilities.
//! 3. Fill missing cells with the column mean of present values, then
//!    centre every column.
//! 4. Eigen-decompose the subjects x subjects Gram matrix; coordinates are
//!    `v_k * sqrt(lambda_k)`, loadings are `X^T v_k / sqrt(lambda_k)`.
//! 5. Orient the axes: around an anchor subject when one is configured and
//!    present, otherwise so the largest-magnitude coordinate on each axis is
//!    positive.

use nalgebra::linalg::SymmetricEigen;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::subject::SubjectKind;

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Subjects missing more than this share of items are left out.
    pub max_missing_fraction: f64,
    /// Z-score each subject's utilities before stacking.
    pub standardize: bool,
    /// Subject name or key placed at negative x and positive y.
    pub anchor: Option<String>,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_missing_fraction: 0.2,
            standardize: true,
            anchor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSubject {
    pub subject_key: String,
    pub subject_name: String,
    pub subject_kind: SubjectKind,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSubject {
    pub subject_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub fingerprint: String,
    pub item_ids: Vec<String>,
    /// Ordered by subject key.
    pub rows: Vec<ProjectedSubject>,
    /// Share of total variance captured by each axis.
    pub explained_variance: [f64; 2],
    /// Per-item weights of each axis, aligned with `item_ids`.
    pub loadings: [Vec<f64>; 2],
    pub excluded: Vec<ExcludedSubject>,
    /// Whether the configured anchor oriented the axes.
    pub anchored: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("need at least two subjects to project, have {included} ({excluded} excluded)")]
    TooFewSubjects { included: usize, excluded: usize },
    #[error("item set {0} has no items")]
    EmptyItemSet(String),
}

/// Project every entry stored under `fingerprint`.
pub fn project(
    fingerprint: &str,
    entries: &[CacheEntry],
    cfg: &ProjectionConfig,
) -> Result<Projection, ProjectionError> {
    let mut sorted: Vec<&CacheEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.subject_key.cmp(&b.subject_key));

    let item_ids = sorted
        .iter()
        .find(|e| e.fingerprint == fingerprint)
        .map(|e| e.item_ids.clone())
        .unwrap_or_default();
    let n_items = item_ids.len();

    let mut excluded = Vec::new();
    let mut included: Vec<&CacheEntry> = Vec::new();
    for entry in sorted {
        let reason = if entry.fingerprint != fingerprint {
            Some(format!("fitted on item set {}", entry.fingerprint))
        } else if entry.means.len() != n_items {
            Some(format!(
                "has {} utilities for {n_items} items",
                entry.means.len()
            ))
        } else if entry.missing_fraction() > cfg.max_missing_fraction {
            Some(format!(
                "missing {:.0}% of items (limit {:.0}%)",
                entry.missing_fraction() * 100.0,
                cfg.max_missing_fraction * 100.0
            ))
        } else {
            None
        };
        match reason {
            Some(reason) => {
                debug!(subject = %entry.subject_key, %reason, "excluded from projection");
                excluded.push(ExcludedSubject {
                    subject_key: entry.subject_key.clone(),
                    reason,
                });
            }
            None => included.push(entry),
        }
    }

    if included.len() < 2 {
        return Err(ProjectionError::TooFewSubjects {
            included: included.len(),
            excluded: excluded.len(),
        });
    }
    if n_items == 0 {
        return Err(ProjectionError::EmptyItemSet(fingerprint.to_string()));
    }

    let rows: Vec<Vec<Option<f64>>> = included
        .iter()
        .map(|e| {
            let row: Vec<Option<f64>> = e
                .means
                .iter()
                .map(|m| m.filter(|v| v.is_finite()))
                .collect();
            if cfg.standardize {
                standardize_row(&row)
            } else {
                row
            }
        })
        .collect();
    let x = impute_and_centre(&rows, n_items);

    let (mut coords, explained, mut loadings) = principal_axes(&x);

    let anchor_index = cfg.anchor.as_deref().and_then(|anchor| {
        included
            .iter()
            .position(|e| e.subject_name == anchor || e.subject_key == anchor)
    });
    if cfg.anchor.is_some() && anchor_index.is_none() {
        warn!(anchor = ?cfg.anchor, "projection anchor not among projected subjects");
    }

    for axis in 0..2 {
        let flip = match anchor_index {
            // x negative, y positive.
            Some(idx) if axis == 0 => coords[idx][0] > 0.0,
            Some(idx) => coords[idx][1] < 0.0,
            None => {
                let mut best = 0.0_f64;
                for c in &coords {
                    if c[axis].abs() > best.abs() + EPS {
                        best = c[axis];
                    }
                }
                best < 0.0
            }
        };
        if flip {
            for c in coords.iter_mut() {
                c[axis] = -c[axis];
            }
            for w in loadings[axis].iter_mut() {
                *w = -*w;
            }
        }
    }

    let rows = included
        .iter()
        .zip(&coords)
        .map(|(e, c)| ProjectedSubject {
            subject_key: e.subject_key.clone(),
            subject_name: e.subject_name.clone(),
            subject_kind: e.subject_kind,
            x: c[0],
            y: c[1],
        })
        .collect();

    Ok(Projection {
        fingerprint: fingerprint.to_string(),
        item_ids,
        rows,
        explained_variance: explained,
        loadings,
        excluded,
        anchored: anchor_index.is_some(),
    })
}

fn standardize_row(row: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<f64> = row.iter().flatten().copied().collect();
    if present.is_empty() {
        return row.to_vec();
    }
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    let var = if present.len() > 1 {
        present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (present.len() - 1) as f64
    } else {
        0.0
    };
    let std = var.sqrt();
    row.iter()
        .map(|v| {
            v.map(|v| {
                if std > EPS {
                    (v - mean) / std
                } else {
                    0.0
                }
            })
        })
        .collect()
}

fn impute_and_centre(rows: &[Vec<Option<f64>>], n_items: usize) -> DMatrix<f64> {
    let m = rows.len();
    let mut x = DMatrix::<f64>::zeros(m, n_items);
    for col in 0..n_items {
        let present: Vec<f64> = rows.iter().filter_map(|r| r[col]).collect();
        let fill = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };
        for (r, row) in rows.iter().enumerate() {
            x[(r, col)] = row[col].unwrap_or(fill) - fill;
        }
    }
    x
}

type Axes = (Vec<[f64; 2]>, [f64; 2], [Vec<f64>; 2]);

fn principal_axes(x: &DMatrix<f64>) -> Axes {
    let m = x.nrows();
    let n = x.ncols();
    let gram = x * x.transpose();
    let total: f64 = gram.trace().max(0.0);

    let mut coords = vec![[0.0; 2]; m];
    let mut loadings = [vec![0.0; n], vec![0.0; n]];
    let mut explained = [0.0; 2];
    if total <= EPS {
        return (coords, explained, loadings);
    }

    let eig = SymmetricEigen::new(gram);
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]).then(a.cmp(&b)));

    for (axis, &k) in order.iter().take(2).enumerate() {
        let lambda = eig.eigenvalues[k].max(0.0);
        if lambda <= EPS * total {
            continue;
        }
        let v = eig.eigenvectors.column(k);
        let root = lambda.sqrt();
        for r in 0..m {
            coords[r][axis] = v[r] * root;
        }
        let w = x.transpose() * v;
        for (c, value) in w.iter().enumerate() {
            loadings[axis][c] = value / root;
        }
        explained[axis] = lambda / total;
    }
    (coords, explained, loadings)
}

impl Projection {
    /// Subject table as CSV, one row per projected subject.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "subject_key,subject_name,subject_kind,x,y,explained_variance_1,explained_variance_2\n",
        );
        for row in &self.rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                csv_field(&row.subject_key),
                csv_field(&row.subject_name),
                row.subject_kind.as_str(),
                row.x,
                row.y,
                self.explained_variance[0],
                self.explained_variance[1]
            ));
        }
        out
    }

    pub fn row(&self, subject_key: &str) -> Option<&ProjectedSubject> {
        self.rows.iter().find(|r| r.subject_key == subject_key)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
