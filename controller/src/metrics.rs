//! Metrics contains the metrics helpers for the controllers.

use metrics::counter;

/// Reconcile_run counts one call into a reconciler.
pub(crate) fn reconcile_run(controller: &'static str) {
    counter!("reconcile_runs_total", "controller" => controller).increment(1);
}

/// Reconcile_failure counts one reconciler call that ended in an error.
pub(crate) fn reconcile_failure(controller: &'static str) {
    counter!("reconcile_failures_total", "controller" => controller).increment(1);
}
