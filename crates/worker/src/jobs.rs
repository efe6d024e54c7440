//! Scheduled maintenance jobs over the payments ledger and provider event log

use saasbill_payments::{
    InvariantCheckSummary, InvariantChecker, PaymentsResult, ViolationSeverity, WebhookHandler,
};
use time::Duration;

/// Counts from one replay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub recovered: usize,
    pub still_failing: usize,
}

/// Run every invariant check and log each violation at a level matching its severity.
pub async fn run_invariant_checks(
    checker: &InvariantChecker,
) -> PaymentsResult<InvariantCheckSummary> {
    let summary = checker.run_all_checks().await?;
    log_invariant_summary(&summary);
    Ok(summary)
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                tenants = violation.tenant_ids.len(),
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => tracing::warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                tenants = violation.tenant_ids.len(),
                "{}",
                violation.description
            ),
        }
    }

    if summary.healthy {
        tracing::info!(checks_run = summary.checks_run, "Billing invariants healthy");
    } else {
        tracing::error!(
            checks_run = summary.checks_run,
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariant violations detected"
        );
    }
}

/// Replay up to `batch` failed provider events.
pub async fn replay_failed_events(
    handler: &WebhookHandler,
    batch: i64,
) -> PaymentsResult<ReplaySummary> {
    let results = handler.replay_failed(Some(batch)).await?;

    let recovered = results.iter().filter(|r| r.success).count();
    let summary = ReplaySummary {
        replayed: results.len(),
        recovered,
        still_failing: results.len() - recovered,
    };

    if summary.replayed > 0 {
        tracing::info!(
            replayed = summary.replayed,
            recovered = summary.recovered,
            still_failing = summary.still_failing,
            "Failed provider events replayed"
        );
    }
    for result in results.iter().filter(|r| !r.success) {
        tracing::warn!(
            event_id = %result.provider_event_id,
            event_type = %result.event_type,
            error = result.new_error.as_deref().unwrap_or("unknown"),
            "Provider event still failing after replay"
        );
    }

    Ok(summary)
}

/// Drop successfully processed events older than `retention_days`.
pub async fn cleanup_event_log(
    handler: &WebhookHandler,
    retention_days: i64,
) -> PaymentsResult<u64> {
    handler
        .cleanup_processed(Duration::days(retention_days))
        .await
}
