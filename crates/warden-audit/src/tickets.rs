//! Tickets opened from audit outcomes

use crate::diagnostics::DiagnosticReport;
use crate::report::escalation_description;
use warden_core::{NewRequest, Priority};

/// Longest title kept before truncation
const MAX_TITLE_CHARS: usize = 120;

/// One ticket per audit recommendation
///
/// Priority comes from a leading `CRITICAL|HIGH|MEDIUM|LOW:` label and
/// defaults to high; the label is stripped from the title.
#[must_use]
pub fn recommendation_ticket(recommendation: &str, assignee: &str) -> NewRequest {
    let (priority, body) = Priority::from_label(recommendation).unwrap_or((Priority::default(), recommendation));
    let body = body.trim();
    let title = if body.chars().count() > MAX_TITLE_CHARS {
        let cut: String = body.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("Audit: {cut}...")
    } else {
        format!("Audit: {body}")
    };
    NewRequest::new(title, recommendation.trim(), priority)
        .assigned_to(assignee)
        .with_label("audit")
}

/// The single highest-priority escalation ticket
#[must_use]
pub fn escalation_ticket(audit_id: &str, attempts: u32, report: &DiagnosticReport, owner: &str) -> NewRequest {
    NewRequest::new(
        format!("P0: audit {audit_id} unanswered ({} severity, {})", report.severity, report.probable_cause),
        escalation_description(audit_id, attempts, report),
        Priority::Critical,
    )
    .assigned_to(owner)
    .with_label("escalation")
    .with_label("audit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_sets_priority() {
        let ticket = recommendation_ticket("CRITICAL: rotate leaked API key", "remediation-engineer");
        assert_eq!(ticket.priority, Priority::Critical);
        assert_eq!(ticket.title, "Audit: rotate leaked API key");
        assert_eq!(ticket.description, "CRITICAL: rotate leaked API key");
        assert_eq!(ticket.assigned_to.as_deref(), Some("remediation-engineer"));

        assert_eq!(recommendation_ticket("low: tidy logs", "x").priority, Priority::Low);
    }

    #[test]
    fn unlabeled_defaults_to_high() {
        let ticket = recommendation_ticket("add retries to the uploader", "x");
        assert_eq!(ticket.priority, Priority::High);
        assert_eq!(ticket.title, "Audit: add retries to the uploader");
    }

    #[test]
    fn long_titles_are_truncated() {
        let ticket = recommendation_ticket(&"a".repeat(500), "x");
        assert_eq!(ticket.title.chars().count(), "Audit: ".len() + MAX_TITLE_CHARS);
        assert!(ticket.title.ends_with("..."));
    }
}
