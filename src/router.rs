//! Turns a manifest diff into concrete push tasks (§4.9). Deletions are
//! never synthesized into transfer tasks; propagating a delete to a peer
//! is a distinct, not-yet-built concern (see `ShareConfig::delete_propagation`).

use crate::manifest::differ::DiffResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub share: String,
    pub relative_path: String,
}

/// Paths from `added` and `modified` become push tasks, in that order,
/// each sorted ascending; `deleted` is ignored here by design.
pub fn plan_transfers(share: &str, diff: &DiffResult) -> Vec<PlannedTransfer> {
    diff.added
        .iter()
        .chain(diff.modified.iter())
        .map(|path| PlannedTransfer {
            share: share.to_string(),
            relative_path: path.clone(),
        })
        .collect()
}

/// Restricts a plan to the shares a given peer is allowed to touch,
/// dropping anything else silently — the caller already knows which
/// shares it asked about, an unauthorized entry here means upstream
/// logic built the list incorrectly, not a condition to surface.
pub fn filter_allowed<'a>(
    plans: impl IntoIterator<Item = &'a PlannedTransfer>,
    allowed_shares: &[String],
) -> Vec<PlannedTransfer> {
    plans
        .into_iter()
        .filter(|p| allowed_shares.iter().any(|s| s == &p.share))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::differ::DiffSummary;

    fn diff(added: &[&str], modified: &[&str], deleted: &[&str]) -> DiffResult {
        DiffResult {
            added: added.iter().map(|s| s.to_string()).collect(),
            modified: modified.iter().map(|s| s.to_string()).collect(),
            deleted: deleted.iter().map(|s| s.to_string()).collect(),
            summary: DiffSummary::default(),
        }
    }

    #[test]
    fn plans_added_and_modified_but_not_deleted() {
        let d = diff(&["a.txt"], &["b.txt"], &["c.txt"]);
        let plans = plan_transfers("docs", &d);
        let paths: Vec<&str> = plans.iter().map(|p| p.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
        assert!(plans.iter().all(|p| p.share == "docs"));
    }

    #[test]
    fn filter_allowed_drops_unlisted_shares() {
        let plans = vec![
            PlannedTransfer {
                share: "docs".to_string(),
                relative_path: "a.txt".to_string(),
            },
            PlannedTransfer {
                share: "secret".to_string(),
                relative_path: "b.txt".to_string(),
            },
        ];
        let allowed = vec!["docs".to_string()];
        let filtered = filter_allowed(&plans, &allowed);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].share, "docs");
    }
}
