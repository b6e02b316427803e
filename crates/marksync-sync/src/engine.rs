//! Path-keyed reconciliation of a pruned forest against an [`ItemStore`].
//!
//! Every node is identified by its path. Nodes are upserted parent before child,
//! one transaction per root label; stored rows whose path was not seen during the
//! run are deleted afterwards in a separate transaction, deepest first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use marksync_core::{ItemRow, RootTree, StoredItem, TreeNode};
use marksync_storage::{ItemStore, StoreError, UpsertOutcome, UpsertResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

/// What happens to the rest of a root when one node fails to upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abandon the failed node's subtree; siblings continue and the root commits.
    #[default]
    SkipSubtree,
    /// Roll the whole root back on the first node failure.
    AbortRoot,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkipSubtree => "skip-subtree",
            Self::AbortRoot => "abort-root",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip-subtree" | "skip_subtree" => Ok(Self::SkipSubtree),
            "abort-root" | "abort_root" => Ok(Self::AbortRoot),
            other => Err(format!(
                "unknown failure policy `{other}` (expected skip-subtree or abort-root)"
            )),
        }
    }
}

/// Per-scope counters, merged into run totals by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub malformed: usize,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.malformed += other.malformed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MalformedNode,
    StorageUnavailable,
    StorageOperationFailed,
    PathLookupInconsistency,
    DuplicatePath,
    RootRolledBack,
    DeletionRolledBack,
    SourceUnreadable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub detail: String,
}

/// Outcome of syncing one scope: the root labels of a single source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeReport {
    pub scope: String,
    pub labels: Vec<String>,
    pub stats: SyncStats,
    pub rolled_back: Vec<String>,
    pub issues: Vec<SyncIssue>,
}

impl ScopeReport {
    pub fn new(scope: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            scope: scope.into(),
            labels,
            ..Self::default()
        }
    }

    pub fn push_issue(
        &mut self,
        kind: IssueKind,
        label: Option<&str>,
        path: Option<&str>,
        detail: impl Into<String>,
    ) {
        self.issues.push(SyncIssue {
            kind,
            label: label.map(ToString::to_string),
            path: path.map(ToString::to_string),
            detail: detail.into(),
        });
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &SyncIssue> {
        self.issues.iter().filter(move |issue| issue.kind == kind)
    }
}

pub struct PathSyncEngine {
    policy: FailurePolicy,
    synced_at: DateTime<Utc>,
}

struct PendingNode<'a> {
    node: &'a TreeNode,
    parent_id: Option<i64>,
    parent_path: Option<String>,
}

#[derive(Default)]
struct RootWalk {
    stats: SyncStats,
    seen: BTreeSet<String>,
    inserted_paths: Vec<String>,
    aborted: bool,
}

impl PathSyncEngine {
    pub fn new(policy: FailurePolicy, synced_at: DateTime<Utc>) -> Self {
        Self { policy, synced_at }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Reconciles `forest` into `store`. The managed labels are the forest's root labels;
    /// `existing` is the set of stored paths for those labels taken before the run.
    pub async fn sync<S>(
        &self,
        scope: &str,
        forest: &[RootTree],
        mut existing: BTreeSet<String>,
        store: &mut S,
    ) -> ScopeReport
    where
        S: ItemStore + ?Sized,
    {
        let labels = managed_labels(forest);
        let mut report = ScopeReport::new(scope, labels.clone());
        let mut seen = BTreeSet::new();

        for root in forest {
            self.sync_root(root, &mut existing, &mut seen, store, &mut report)
                .instrument(info_span!("sync_root", label = %root.label))
                .await;
        }

        report.stats.deleted = self
            .sweep(&labels, &seen, store, &mut report)
            .instrument(info_span!("sweep", scope))
            .await;

        info!(
            scope,
            inserted = report.stats.inserted,
            updated = report.stats.updated,
            deleted = report.stats.deleted,
            unchanged = report.stats.unchanged,
            skipped = report.stats.skipped,
            failed = report.stats.failed,
            "scope synced"
        );
        report
    }

    async fn sync_root<S>(
        &self,
        root: &RootTree,
        existing: &mut BTreeSet<String>,
        seen: &mut BTreeSet<String>,
        store: &mut S,
        report: &mut ScopeReport,
    ) where
        S: ItemStore + ?Sized,
    {
        if let Err(err) = store.begin().await {
            warn!(error = %err, "could not open root transaction");
            report.push_issue(
                IssueKind::StorageOperationFailed,
                Some(&root.label),
                None,
                format!("opening transaction: {err}"),
            );
            report.stats.failed += 1;
            report.rolled_back.push(root.label.clone());
            return;
        }

        let walk = self.walk_root(root, existing, seen, store, report).await;

        if walk.aborted {
            if let Err(err) = store.rollback().await {
                warn!(error = %err, "rollback failed");
            }
            warn!("root rolled back after node failure");
            report.push_issue(
                IssueKind::RootRolledBack,
                Some(&root.label),
                None,
                format!("rolled back under {} after a node failure", self.policy),
            );
            report.stats.failed += walk.stats.failed;
            report.stats.skipped += walk.stats.skipped;
            report.rolled_back.push(root.label.clone());
            return;
        }

        match store.commit().await {
            Ok(()) => {
                debug!(
                    inserted = walk.stats.inserted,
                    updated = walk.stats.updated,
                    "root committed"
                );
                report.stats += walk.stats;
                seen.extend(walk.seen);
                existing.extend(walk.inserted_paths);
            }
            Err(err) => {
                warn!(error = %err, "root commit failed");
                report.push_issue(
                    IssueKind::RootRolledBack,
                    Some(&root.label),
                    None,
                    format!("commit failed: {err}"),
                );
                report.stats.failed += walk.stats.failed + 1;
                report.stats.skipped += walk.stats.skipped;
                report.rolled_back.push(root.label.clone());
            }
        }
    }

    async fn walk_root<S>(
        &self,
        root: &RootTree,
        existing: &BTreeSet<String>,
        committed: &BTreeSet<String>,
        store: &mut S,
        report: &mut ScopeReport,
    ) -> RootWalk
    where
        S: ItemStore + ?Sized,
    {
        let mut walk = RootWalk::default();
        let mut stack = vec![PendingNode {
            node: &root.root,
            parent_id: None,
            parent_path: None,
        }];

        while let Some(pending) = stack.pop() {
            let node = pending.node;
            let row = ItemRow::from_node(
                node,
                pending.parent_id,
                pending.parent_path.as_deref(),
                &root.label,
            );

            if walk.seen.contains(&row.path) || committed.contains(&row.path) {
                warn!(path = %row.path, "duplicate path; skipping subtree");
                report.push_issue(
                    IssueKind::DuplicatePath,
                    Some(&root.label),
                    Some(&row.path),
                    "another node already synced this path in the current run",
                );
                walk.stats.skipped += node.node_count();
                continue;
            }

            match self.upsert_node(&row, existing, store, report).await {
                Ok(UpsertResult { id, outcome }) => {
                    match outcome {
                        UpsertOutcome::Inserted => {
                            walk.stats.inserted += 1;
                            walk.inserted_paths.push(row.path.clone());
                        }
                        UpsertOutcome::Updated => walk.stats.updated += 1,
                        UpsertOutcome::Unchanged => walk.stats.unchanged += 1,
                    }
                    // Reversed so the stack pops children in source order.
                    for child in node.children().iter().rev() {
                        stack.push(PendingNode {
                            node: child,
                            parent_id: Some(id),
                            parent_path: Some(row.path.clone()),
                        });
                    }
                    walk.seen.insert(row.path);
                }
                Err(err) => {
                    let abandoned = node.node_count() - 1;
                    warn!(path = %row.path, error = %err, abandoned, "upsert failed; abandoning subtree");
                    report.push_issue(
                        IssueKind::StorageOperationFailed,
                        Some(&root.label),
                        Some(&row.path),
                        err.to_string(),
                    );
                    walk.stats.failed += 1;
                    walk.stats.skipped += abandoned;
                    if self.policy == FailurePolicy::AbortRoot {
                        walk.aborted = true;
                        break;
                    }
                }
            }
        }
        walk
    }

    async fn upsert_node<S>(
        &self,
        row: &ItemRow,
        existing: &BTreeSet<String>,
        store: &mut S,
        report: &mut ScopeReport,
    ) -> Result<UpsertResult, StoreError>
    where
        S: ItemStore + ?Sized,
    {
        if existing.contains(&row.path) && store.find_id_by_path(&row.path).await?.is_none() {
            warn!(path = %row.path, "path listed in scope but not found by lookup; inserting");
            report.push_issue(
                IssueKind::PathLookupInconsistency,
                Some(&row.source),
                Some(&row.path),
                "stored path set and lookup disagree",
            );
        }
        store.upsert_by_path(row, self.synced_at).await
    }

    /// Deletes stored rows of the managed labels that were not seen this run.
    /// Returns the number of rows actually removed; zero when the pass rolled back.
    async fn sweep<S>(
        &self,
        labels: &[String],
        seen: &BTreeSet<String>,
        store: &mut S,
        report: &mut ScopeReport,
    ) -> usize
    where
        S: ItemStore + ?Sized,
    {
        if labels.is_empty() {
            return 0;
        }
        let stored = match store.list_items(labels).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "could not list stored rows; skipping deletion pass");
                report.push_issue(
                    IssueKind::DeletionRolledBack,
                    None,
                    None,
                    format!("listing stored rows: {err}"),
                );
                return 0;
            }
        };

        let depths = depth_by_id(&stored);
        let mut doomed: Vec<(usize, &String)> = stored
            .iter()
            .filter(|item| !seen.contains(&item.path))
            .map(|item| (depths.get(&item.id).copied().unwrap_or(0), &item.path))
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        // Children before parents, so cascades never remove a row we are about to count.
        doomed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        if let Err(err) = store.begin().await {
            warn!(error = %err, "could not open deletion transaction");
            report.push_issue(
                IssueKind::DeletionRolledBack,
                None,
                None,
                format!("opening transaction: {err}"),
            );
            return 0;
        }

        let mut deleted = 0;
        for (_, path) in doomed {
            match store.delete_by_path(path, labels).await {
                Ok(true) => {
                    debug!(path = %path, "deleted");
                    deleted += 1;
                }
                Ok(false) => debug!(path = %path, "already gone"),
                Err(err) => {
                    warn!(path = %path, error = %err, "delete failed; rolling back deletion pass");
                    report.push_issue(
                        IssueKind::DeletionRolledBack,
                        None,
                        Some(path),
                        err.to_string(),
                    );
                    if let Err(err) = store.rollback().await {
                        warn!(error = %err, "rollback failed");
                    }
                    return 0;
                }
            }
        }

        match store.commit().await {
            Ok(()) => deleted,
            Err(err) => {
                warn!(error = %err, "deletion commit failed");
                report.push_issue(
                    IssueKind::DeletionRolledBack,
                    None,
                    None,
                    format!("commit failed: {err}"),
                );
                0
            }
        }
    }
}

/// Nesting depth of each stored row, counted along `parent_id` links.
/// Paths are not split: a name containing the separator would skew the count.
fn depth_by_id(items: &[StoredItem]) -> BTreeMap<i64, usize> {
    let parents: BTreeMap<i64, Option<i64>> =
        items.iter().map(|item| (item.id, item.parent_id)).collect();
    items
        .iter()
        .map(|item| {
            let mut depth = 0;
            let mut next = item.parent_id;
            // A corrupt parent chain may loop; stop after visiting every row once.
            while let Some(parent) = next {
                if depth >= parents.len() {
                    break;
                }
                depth += 1;
                next = parents.get(&parent).copied().flatten();
            }
            (item.id, depth)
        })
        .collect()
}

/// Root labels of a forest, first occurrence order, without repeats.
pub fn managed_labels(forest: &[RootTree]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::with_capacity(forest.len());
    for root in forest {
        if !labels.contains(&root.label) {
            labels.push(root.label.clone());
        }
    }
    labels
}

/// Takes the pre-run snapshot of stored paths, then runs the engine.
///
/// When the snapshot cannot be read the scope is reported as failed and nothing is written.
pub async fn sync_forest<S>(
    engine: &PathSyncEngine,
    scope: &str,
    forest: &[RootTree],
    store: &mut S,
) -> ScopeReport
where
    S: ItemStore + ?Sized,
{
    let labels = managed_labels(forest);
    match store.select_paths_by_scope(&labels).await {
        Ok(existing) => engine.sync(scope, forest, existing, store).await,
        Err(err) => {
            warn!(scope, error = %err, "could not read stored paths; scope skipped");
            let mut report = ScopeReport::new(scope, labels);
            report.push_issue(
                IssueKind::StorageUnavailable,
                None,
                None,
                format!("reading stored paths: {err}"),
            );
            report.stats.failed += 1;
            report
        }
    }
}
