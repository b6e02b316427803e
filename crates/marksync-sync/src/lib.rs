//! Sync pipeline orchestration: registry, adapters, allow-list filtering and path sync per source.

mod engine;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use marksync_adapters::{adapter_for_source, AdapterError, SourceInput, SourceKind};
use marksync_core::{Forest, RootTree, StoredItem, TreeFilter};
use marksync_storage::{ItemStore, MemoryItemStore, SqliteItemStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use engine::{
    managed_labels, sync_forest, FailurePolicy, IssueKind, PathSyncEngine, ScopeReport, SyncIssue,
    SyncStats,
};

pub const CRATE_NAME: &str = "marksync-sync";

/// Folder names synced when a tree source does not list its own `allowed_folders`.
pub const DEFAULT_ALLOWED_FOLDERS: &[&str] = &[
    "AI",
    "Startups & Business",
    "Tech & Engineering",
    "Research",
    "Academic Tools",
    "Reference/Citation Map",
    "Design & Marketing",
    "Journalism",
];

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub allowed_folders: Option<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn tree_filter(&self) -> TreeFilter {
        match &self.allowed_folders {
            Some(names) => TreeFilter::new(names.iter().map(String::as_str)),
            None => TreeFilter::new(DEFAULT_ALLOWED_FOLDERS.iter().copied()),
        }
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Source ids must be unique, and at most one bookmark tree may be enabled:
    /// tree root labels are fixed keys, so two enabled trees would sweep each other.
    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}`", source.source_id);
            }
        }
        let trees = self
            .enabled()
            .filter(|source| source.kind.is_tree())
            .count();
        if trees > 1 {
            bail!("{trees} bookmark tree sources are enabled; enable at most one");
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| source.source_id == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub failure_policy: FailurePolicy,
    pub write_reports: bool,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://bookmarks.db".to_string()),
            workspace_root: std::env::var("MARKSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            failure_policy: std::env::var("MARKSYNC_FAILURE_POLICY")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(policy) => Some(policy),
                    Err(err) => {
                        warn!(error = %err, "ignoring MARKSYNC_FAILURE_POLICY");
                        None
                    }
                })
                .unwrap_or_default(),
            write_reports: std::env::var("MARKSYNC_REPORTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            dry_run: false,
        }
    }

    /// Resolves a registry path against the workspace root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_url: String,
    pub failure_policy: FailurePolicy,
    pub dry_run: bool,
    pub enabled_sources: usize,
    pub totals: SyncStats,
    pub scopes: Vec<ScopeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn issue_count(&self) -> usize {
        self.scopes.iter().map(|scope| scope.issues.len()).sum()
    }
}

/// Allow-list view of one source, as printed by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInspection {
    pub source_id: String,
    pub kind: SourceKind,
    pub origin: String,
    pub malformed: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub links_after: usize,
    pub forest: Forest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub item_count: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id, dry_run = self.config.dry_run))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let enabled: Vec<&SourceConfig> = registry.enabled().collect();

        let mut store = SqliteItemStore::connect(&self.config.database_url)
            .await
            .context("storage unavailable; no rows were touched")?;
        let engine = PathSyncEngine::new(self.config.failure_policy, started_at);

        let mut scopes = Vec::with_capacity(enabled.len());
        let mut totals = SyncStats::default();
        for source in &enabled {
            let report = self
                .sync_source(&engine, source, &mut store)
                .instrument(info_span!("sync_source", source_id = %source.source_id))
                .await;
            totals += report.stats;
            scopes.push(report);
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            database_url: self.config.database_url.clone(),
            failure_policy: self.config.failure_policy,
            dry_run: self.config.dry_run,
            enabled_sources: enabled.len(),
            totals,
            scopes,
            reports_dir: None,
        };

        // Rows are already committed here; a report failure must not hide the counts.
        if self.config.write_reports {
            match self.write_reports(&summary).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
            }
        }

        info!(
            inserted = summary.totals.inserted,
            updated = summary.totals.updated,
            deleted = summary.totals.deleted,
            issues = summary.issue_count(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_source(
        &self,
        engine: &PathSyncEngine,
        source: &SourceConfig,
        store: &mut SqliteItemStore,
    ) -> ScopeReport {
        let input = match self.load_source(source) {
            Ok(input) => input,
            Err(err) => {
                warn!(error = %err, "source unreadable; skipping without deletion pass");
                let mut report = ScopeReport::new(&source.source_id, Vec::new());
                report.push_issue(IssueKind::SourceUnreadable, None, None, err.to_string());
                return report;
            }
        };

        let forest = prepare_forest(source, &input.forest);
        let mut report = if self.config.dry_run {
            let labels = managed_labels(&forest);
            match store.list_items(&labels).await {
                Ok(items) => {
                    let mut preview = MemoryItemStore::from_items(items);
                    sync_forest(engine, &source.source_id, &forest, &mut preview).await
                }
                Err(err) => {
                    let mut report = ScopeReport::new(&source.source_id, labels);
                    report.push_issue(
                        IssueKind::StorageOperationFailed,
                        None,
                        None,
                        format!("loading rows for dry run: {err}"),
                    );
                    report.stats.failed += 1;
                    report
                }
            }
        } else {
            sync_forest(engine, &source.source_id, &forest, store).await
        };

        if input.malformed > 0 {
            report.stats.malformed += input.malformed;
            report.push_issue(
                IssueKind::MalformedNode,
                None,
                None,
                format!(
                    "{} malformed node(s) skipped in {}",
                    input.malformed,
                    input.origin.display()
                ),
            );
        }
        report
    }

    pub fn load_source(&self, source: &SourceConfig) -> Result<SourceInput, AdapterError> {
        let adapter = adapter_for_source(source.kind, &source.source_id, &source.display_name);
        let path = match &source.path {
            Some(path) => self.config.resolve(path),
            None => adapter
                .default_path()
                .ok_or_else(|| AdapterError::MissingInput(source.source_id.clone()))?,
        };
        adapter.load(&path)
    }

    pub async fn inspect_source(&self, source_id: &str) -> Result<SourceInspection> {
        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let source = registry
            .get(source_id)
            .with_context(|| format!("unknown source `{source_id}`"))?;
        let input = self
            .load_source(source)
            .with_context(|| format!("loading source `{source_id}`"))?;
        let forest = prepare_forest(source, &input.forest);
        Ok(SourceInspection {
            source_id: source.source_id.clone(),
            kind: source.kind,
            origin: input.origin.display().to_string(),
            malformed: input.malformed,
            nodes_before: input.forest.iter().map(|root| root.root.node_count()).sum(),
            nodes_after: forest.iter().map(|root| root.root.node_count()).sum(),
            links_after: forest.iter().map(|root| root.root.link_count()).sum(),
            forest,
        })
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
        fs::write(reports_dir.join("sync_summary.json"), json)
            .await
            .context("writing sync_summary.json")?;
        fs::write(reports_dir.join("sync_summary.md"), render_summary_markdown(summary))
            .await
            .context("writing sync_summary.md")?;
        Ok(reports_dir)
    }
}

/// Applies the allow-list to tree sources; flat sources pass through untouched.
pub fn prepare_forest(source: &SourceConfig, forest: &[RootTree]) -> Forest {
    if source.kind.is_tree() {
        source.tree_filter().filter_forest(forest)
    } else {
        forest.to_vec()
    }
}

pub fn render_summary_markdown(summary: &SyncRunSummary) -> String {
    let mut out = format!(
        "# Sync Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Failure policy: {}\n- Dry run: {}\n- Enabled sources: {}\n\n## Scopes\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.failure_policy,
        summary.dry_run,
        summary.enabled_sources,
    );
    for scope in &summary.scopes {
        let s = scope.stats;
        out.push_str(&format!(
            "- {}: inserted {}, updated {}, deleted {}, unchanged {}, skipped {}, failed {}, malformed {}\n",
            scope.scope, s.inserted, s.updated, s.deleted, s.unchanged, s.skipped, s.failed, s.malformed
        ));
    }
    let issues: Vec<String> = summary
        .scopes
        .iter()
        .flat_map(|scope| {
            scope.issues.iter().map(move |issue| {
                let at = issue.path.as_deref().or(issue.label.as_deref()).unwrap_or("-");
                format!("- [{}] {:?} at {}: {}", scope.scope, issue.kind, at, issue.detail)
            })
        })
        .collect();
    if !issues.is_empty() {
        out.push_str("\n## Issues\n");
        out.push_str(&issues.join("\n"));
        out.push('\n');
    }
    out
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once().await
}

/// Writes `items.json` (rows ordered by source, then path) and `manifest.json` into `out_dir`.
/// An empty `sources` list exports every source present in the store.
pub async fn export_items(
    store: &mut SqliteItemStore,
    sources: &[String],
    out_dir: &Path,
) -> Result<ExportManifest> {
    let sources = if sources.is_empty() {
        store.distinct_sources().await.context("listing stored sources")?
    } else {
        sources.to_vec()
    };
    let items: Vec<StoredItem> = store
        .list_items(&sources)
        .await
        .context("reading stored items")?;

    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let items_path = out_dir.join("items.json");
    let bytes = serde_json::to_vec_pretty(&items).context("serializing items")?;
    fs::write(&items_path, bytes)
        .await
        .with_context(|| format!("writing {}", items_path.display()))?;

    let manifest = ExportManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        sources,
        item_count: items.len(),
        files: vec![manifest_entry("items", out_dir, &items_path).await?],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(items = manifest.item_count, dir = %out_dir.display(), "export written");
    Ok(manifest)
}

async fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    const REGISTRY: &str = r#"
sources:
  - source_id: chrome
    display_name: Chrome bookmarks
    kind: chrome_bookmarks
    path: fixtures/chrome/Bookmarks
    allowed_folders: ["AI", "Research", "Journalism"]
  - source_id: reading_list
    display_name: Reading list
    kind: reading_list
    path: fixtures/reading_list/ReadingList.html
  - source_id: github_stars
    display_name: GitHub stars
    kind: github_stars
    enabled: false
"#;

    fn config_for(root: PathBuf, database_url: String) -> SyncConfig {
        SyncConfig {
            database_url,
            workspace_root: root,
            failure_policy: FailurePolicy::SkipSubtree,
            write_reports: true,
            dry_run: false,
        }
    }

    #[test]
    fn registry_parses_defaults_and_enabled_flags() {
        let registry = SourceRegistry::parse(REGISTRY).expect("registry");
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.enabled().count(), 2);
        let reading = registry.get("reading_list").expect("reading list");
        assert!(reading.enabled);
        assert!(reading.allowed_folders.is_none());
        assert_eq!(registry.get("chrome").expect("chrome").kind, SourceKind::ChromeBookmarks);
    }

    #[test]
    fn registry_rejects_duplicate_ids_and_two_enabled_trees() {
        let dup = "sources:\n  - {source_id: a, display_name: A, kind: reading_list}\n  - {source_id: a, display_name: B, kind: liked_videos}\n";
        assert!(SourceRegistry::parse(dup).is_err());

        let trees = "sources:\n  - {source_id: a, display_name: A, kind: chrome_bookmarks}\n  - {source_id: b, display_name: B, kind: chrome_bookmarks}\n";
        assert!(SourceRegistry::parse(trees).is_err());

        let one_disabled = "sources:\n  - {source_id: a, display_name: A, kind: chrome_bookmarks}\n  - {source_id: b, display_name: B, kind: chrome_bookmarks, enabled: false}\n";
        assert!(SourceRegistry::parse(one_disabled).is_ok());
    }

    #[test]
    fn missing_allow_list_falls_back_to_default_folders() {
        let registry = SourceRegistry::parse(
            "sources:\n  - {source_id: chrome, display_name: Chrome, kind: chrome_bookmarks}\n",
        )
        .expect("registry");
        let filter = registry.sources[0].tree_filter();
        assert!(filter.allows("Reference/Citation Map"));
        assert!(filter.allows("Journalism"));
        assert!(!filter.allows("Random"));
    }

    #[test]
    fn checked_in_registry_is_valid() {
        let text = std::fs::read_to_string(workspace_root().join("sources.yaml")).expect("sources.yaml");
        let registry = SourceRegistry::parse(&text).expect("registry");
        assert!(registry.enabled().count() >= 1);
    }

    #[tokio::test]
    async fn run_once_syncs_fixtures_and_writes_summary() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("sources.yaml"), REGISTRY).expect("registry");
        let fixtures = workspace_root().join("fixtures");
        std::fs::create_dir_all(dir.path().join("fixtures")).expect("fixtures dir");
        for sub in ["chrome", "reading_list"] {
            let target = dir.path().join("fixtures").join(sub);
            std::fs::create_dir_all(&target).expect("fixture subdir");
            for entry in std::fs::read_dir(fixtures.join(sub)).expect("read fixtures") {
                let entry = entry.expect("entry");
                std::fs::copy(entry.path(), target.join(entry.file_name())).expect("copy");
            }
        }
        let db = format!("sqlite://{}", dir.path().join("bookmarks.db").display());
        let pipeline = SyncPipeline::new(config_for(dir.path().to_path_buf(), db));

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.enabled_sources, 2);
        assert_eq!(summary.scopes.len(), 2);
        assert!(summary.totals.inserted > 0);
        assert_eq!(summary.totals.deleted, 0);

        let reading = &summary.scopes[1];
        assert_eq!(reading.labels, vec!["reading_list".to_string()]);
        assert_eq!(reading.stats.inserted, 4);
        assert_eq!(reading.stats.malformed, 1);

        let reports_dir = PathBuf::from(summary.reports_dir.clone().expect("reports dir"));
        assert!(reports_dir.join("sync_summary.json").exists());
        assert!(reports_dir.join("sync_summary.md").exists());

        let again = pipeline.run_once().await.expect("second run");
        assert_eq!(again.totals.inserted, 0);
        assert_eq!(again.totals.updated, 0);
        assert_eq!(again.totals.deleted, 0);
        assert_eq!(again.totals.unchanged, summary.totals.inserted);
    }

    #[tokio::test]
    async fn unopenable_database_fails_the_run_before_touching_anything() {
        let dir = tempdir().expect("tempdir");
        let registry = format!(
            "sources:\n  - {{source_id: reading_list, display_name: Reading list, kind: reading_list, path: {}}}\n",
            workspace_root()
                .join("fixtures/reading_list/ReadingList.html")
                .display()
        );
        std::fs::write(dir.path().join("sources.yaml"), registry).expect("registry");
        let db_path = dir.path().join("no-such-dir").join("bookmarks.db");
        let db = format!("sqlite://{}", db_path.display());

        let err = SyncPipeline::new(config_for(dir.path().to_path_buf(), db))
            .run_once()
            .await
            .expect_err("storage should be unavailable");

        assert!(format!("{err:#}").contains("storage unavailable"));
        assert!(!db_path.exists());
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn report_write_failure_keeps_the_run_summary() {
        let dir = tempdir().expect("tempdir");
        let registry = format!(
            "sources:\n  - {{source_id: reading_list, display_name: Reading list, kind: reading_list, path: {}}}\n",
            workspace_root()
                .join("fixtures/reading_list/ReadingList.html")
                .display()
        );
        std::fs::write(dir.path().join("sources.yaml"), registry).expect("registry");
        // A plain file where the reports directory should go.
        std::fs::write(dir.path().join("reports"), "not a directory").expect("blocker");
        let db = format!("sqlite://{}", dir.path().join("bookmarks.db").display());

        let summary = SyncPipeline::new(config_for(dir.path().to_path_buf(), db.clone()))
            .run_once()
            .await
            .expect("run survives report failure");

        assert!(summary.reports_dir.is_none());
        assert_eq!(summary.totals.inserted, 4);
        let mut store = SqliteItemStore::connect(&db).await.expect("connect");
        let stored = store
            .list_items(&["reading_list".to_string()])
            .await
            .expect("items");
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn unreadable_source_is_reported_without_wiping_rows() {
        let dir = tempdir().expect("tempdir");
        let registry = "sources:\n  - {source_id: stars, display_name: Stars, kind: github_stars, path: missing.json}\n";
        std::fs::write(dir.path().join("sources.yaml"), registry).expect("registry");
        let db = format!("sqlite://{}", dir.path().join("bookmarks.db").display());
        let mut config = config_for(dir.path().to_path_buf(), db);
        config.write_reports = false;

        let summary = SyncPipeline::new(config).run_once().await.expect("run");
        let scope = &summary.scopes[0];
        assert_eq!(scope.issues_of(IssueKind::SourceUnreadable).count(), 1);
        assert_eq!(scope.stats, SyncStats::default());
        assert!(summary.reports_dir.is_none());
    }

    #[tokio::test]
    async fn dry_run_leaves_the_database_untouched() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("sources.yaml"),
            format!(
                "sources:\n  - {{source_id: reading_list, display_name: Reading list, kind: reading_list, path: {}}}\n",
                workspace_root()
                    .join("fixtures/reading_list/ReadingList.html")
                    .display()
            ),
        )
        .expect("registry");
        let db = format!("sqlite://{}", dir.path().join("bookmarks.db").display());
        let mut config = config_for(dir.path().to_path_buf(), db.clone());
        config.dry_run = true;
        config.write_reports = false;

        let summary = SyncPipeline::new(config).run_once().await.expect("dry run");
        assert!(summary.dry_run);
        assert_eq!(summary.totals.inserted, 4);

        let mut store = SqliteItemStore::connect(&db).await.expect("connect");
        let stored = store
            .list_items(&["reading_list".to_string()])
            .await
            .expect("items");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn export_writes_items_and_checksummed_manifest() {
        let dir = tempdir().expect("tempdir");
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        let forest = marksync_adapters::flat_forest(
            "stars",
            "Stars",
            vec![
                marksync_core::TreeNode::link("tokio-rs/tokio", "https://github.com/tokio-rs/tokio"),
                marksync_core::TreeNode::link("serde-rs/serde", "https://github.com/serde-rs/serde"),
            ],
        );
        let engine = PathSyncEngine::new(FailurePolicy::SkipSubtree, Utc::now());
        sync_forest(&engine, "stars", &forest, &mut store).await;

        let out = dir.path().join("export");
        let manifest = export_items(&mut store, &[], &out).await.expect("export");

        assert_eq!(manifest.sources, vec!["stars".to_string()]);
        assert_eq!(manifest.item_count, 3);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "items.json");

        let bytes = std::fs::read(out.join("items.json")).expect("items");
        assert_eq!(manifest.files[0].bytes, bytes.len() as u64);
        assert_eq!(manifest.files[0].sha256, hex::encode(Sha256::digest(&bytes)));

        let items: Vec<StoredItem> = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(items[0].path, "Stars");
        assert_eq!(items[1].parent_path.as_deref(), Some("Stars"));
        assert!(out.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn inspect_shows_the_allow_listed_forest() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("sources.yaml"),
            format!(
                "sources:\n  - {{source_id: chrome, display_name: Chrome, kind: chrome_bookmarks, path: {}, allowed_folders: [AI]}}\n",
                workspace_root().join("fixtures/chrome/Bookmarks").display()
            ),
        )
        .expect("registry");
        let pipeline = SyncPipeline::new(config_for(
            dir.path().to_path_buf(),
            "sqlite::memory:".to_string(),
        ));

        let inspection = pipeline.inspect_source("chrome").await.expect("inspect");
        assert_eq!(inspection.malformed, 2);
        assert_eq!(inspection.forest.len(), 3);
        assert!(inspection.nodes_after < inspection.nodes_before);
        // Bookmarks bar: AI, Attention, Top level link; Research is not allowed here.
        assert_eq!(inspection.forest[0].root.node_count(), 4);
        assert!(pipeline.inspect_source("nope").await.is_err());
    }

    #[test]
    fn summary_markdown_lists_scopes_and_issues() {
        let mut scope = ScopeReport::new("chrome", vec!["bookmark_bar".to_string()]);
        scope.stats.inserted = 3;
        scope.push_issue(IssueKind::DuplicatePath, Some("bookmark_bar"), Some("A>>B"), "dup");
        let summary = SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            database_url: "sqlite::memory:".to_string(),
            failure_policy: FailurePolicy::AbortRoot,
            dry_run: false,
            enabled_sources: 1,
            totals: scope.stats,
            scopes: vec![scope],
            reports_dir: None,
        };

        let md = render_summary_markdown(&summary);
        assert!(md.contains("Failure policy: abort-root"));
        assert!(md.contains("- chrome: inserted 3"));
        assert!(md.contains("DuplicatePath at A>>B: dup"));
    }
}
