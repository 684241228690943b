//! Optional reporting of intermediate model quantities.
//!
//! The caller and driver hand named matrices and vectors to a [`DiagnosticsSink`] as
//! they are computed. `NoDiagnostics` discards them; `LogDiagnostics` renders them
//! through the `log` facade at debug level, and per-cluster detail at trace level.

use itertools::Itertools;
use ndarray::{ArrayView1, ArrayView2};
use std::fmt::Write;

pub trait DiagnosticsSink: Sync {
    /// A model-wide matrix, e.g. the inverse crosstalk or a cycle's precision.
    fn matrix(&self, name: &str, value: ArrayView2<f64>);

    /// A model-wide vector, e.g. the brightness of every cluster.
    fn vector(&self, name: &str, value: ArrayView1<f64>);

    /// Whether per-cluster quantities should be produced at all. Computing them is
    /// skipped entirely when this returns false.
    fn wants_cluster_detail(&self) -> bool {
        false
    }

    /// A per-cluster matrix such as the processed intensities.
    fn cluster_matrix(&self, _: usize, _: &str, _: ArrayView2<f64>) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiagnostics;

impl DiagnosticsSink for NoDiagnostics {
    fn matrix(&self, _: &str, _: ArrayView2<f64>) {}
    fn vector(&self, _: &str, _: ArrayView1<f64>) {}
}

/// Writes diagnostics to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

fn render_matrix(value: ArrayView2<f64>) -> String {
    let mut out = String::new();
    for row in value.rows() {
        out.push('\n');
        for v in row {
            let _ = write!(out, " {v:>12.5e}");
        }
    }
    out
}

impl DiagnosticsSink for LogDiagnostics {
    fn matrix(&self, name: &str, value: ArrayView2<f64>) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{} ({}x{}):{}", name, value.nrows(), value.ncols(), render_matrix(value));
        }
    }

    fn vector(&self, name: &str, value: ArrayView1<f64>) {
        if log::log_enabled!(log::Level::Debug) {
            let rendered = value.iter().map(|v| format!("{v:.5e}")).join(" ");
            log::debug!("{} ({}): {}", name, value.len(), rendered);
        }
    }

    fn wants_cluster_detail(&self) -> bool {
        log::log_enabled!(log::Level::Trace)
    }

    fn cluster_matrix(&self, cluster: usize, name: &str, value: ArrayView2<f64>) {
        log::trace!("{} of cluster {}:{}", name, cluster, render_matrix(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn matrices_render_one_line_per_row() {
        let rendered = render_matrix(array![[1.0, 2.0], [3.0, 4.0]].view());
        assert_eq!(rendered.lines().count(), 3);
        assert!(rendered.contains("4.00000e0"));
    }

    #[test]
    fn silent_sinks_skip_cluster_detail() {
        assert!(!NoDiagnostics.wants_cluster_detail());
        // No logger is installed in unit tests, so trace is never enabled.
        assert!(!LogDiagnostics.wants_cluster_detail());
    }
}
