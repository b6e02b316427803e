//! Source adapters: read exported browser/API data from disk into typed forests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use marksync_core::{
    webkit_micros_from_datetime, webkit_micros_from_unix_seconds, Forest, RootTree, TreeNode,
};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "marksync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ChromeBookmarks,
    ReadingList,
    LikedVideos,
    GithubStars,
}

impl SourceKind {
    /// Tree sources carry nested folders and go through the allow-list filter.
    pub fn is_tree(self) -> bool {
        matches!(self, Self::ChromeBookmarks)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("no input file for source {0}; set `path` in sources.yaml")]
    MissingInput(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Typed forest read from one source file, with the count of nodes dropped as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInput {
    pub origin: PathBuf,
    pub forest: Forest,
    pub malformed: usize,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Where to read from when the registry gives no explicit path.
    fn default_path(&self) -> Option<PathBuf> {
        None
    }

    fn load(&self, path: &Path) -> Result<SourceInput, AdapterError>;
}

#[derive(Debug, Clone)]
struct ChromeBookmarksAdapter {
    source_id: String,
}

#[derive(Debug, Clone)]
struct FlatListAdapter {
    source_id: String,
    display_name: String,
    kind: SourceKind,
}

impl SourceAdapter for ChromeBookmarksAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ChromeBookmarks
    }

    fn default_path(&self) -> Option<PathBuf> {
        locate_chrome_bookmarks()
    }

    fn load(&self, path: &Path) -> Result<SourceInput, AdapterError> {
        let text = read_text_file(path)?;
        let (forest, malformed) = parse_chrome_bookmarks(&text)?;
        if malformed > 0 {
            warn!(source_id = %self.source_id, malformed, path = %path.display(), "skipped malformed bookmark nodes");
        }
        debug!(source_id = %self.source_id, roots = forest.len(), "loaded chrome bookmarks");
        Ok(SourceInput {
            origin: path.to_path_buf(),
            forest,
            malformed,
        })
    }
}

impl SourceAdapter for FlatListAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn default_path(&self) -> Option<PathBuf> {
        match self.kind {
            SourceKind::ReadingList => locate_reading_list(),
            _ => None,
        }
    }

    fn load(&self, path: &Path) -> Result<SourceInput, AdapterError> {
        let text = read_text_file(path)?;
        let (links, malformed) = match self.kind {
            SourceKind::ReadingList => parse_reading_list_html(&text)?,
            SourceKind::LikedVideos => parse_liked_videos(&text)?,
            SourceKind::GithubStars => parse_github_stars(&text)?,
            SourceKind::ChromeBookmarks => {
                return Err(AdapterError::Message(format!(
                    "source {} is a bookmark tree, not a flat list",
                    self.source_id
                )))
            }
        };
        if malformed > 0 {
            warn!(source_id = %self.source_id, malformed, path = %path.display(), "skipped malformed entries");
        }
        Ok(SourceInput {
            origin: path.to_path_buf(),
            forest: flat_forest(&self.source_id, &self.display_name, links),
            malformed,
        })
    }
}

pub fn adapter_for_source(
    kind: SourceKind,
    source_id: &str,
    display_name: &str,
) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::ChromeBookmarks => Box::new(ChromeBookmarksAdapter {
            source_id: source_id.to_string(),
        }),
        SourceKind::ReadingList | SourceKind::LikedVideos | SourceKind::GithubStars => {
            Box::new(FlatListAdapter {
                source_id: source_id.to_string(),
                display_name: display_name.to_string(),
                kind,
            })
        }
    }
}

/// Lifts a flat list into a forest with one root labelled by the source id.
pub fn flat_forest(source_id: &str, display_name: &str, links: Vec<TreeNode>) -> Forest {
    vec![RootTree::new(
        source_id,
        TreeNode::folder(display_name, links),
    )]
}

fn read_text_file(path: &Path) -> Result<String, AdapterError> {
    Ok(fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn rfc3339_to_webkit(value: Option<&str>) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(value?.trim()).ok()?;
    webkit_micros_from_datetime(parsed.with_timezone(&Utc))
}

// Chrome profile discovery

/// Candidate Chrome user-data directories for the current platform.
pub fn chrome_user_data_dirs() -> Vec<PathBuf> {
    if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|dir| dir.join("Google").join("Chrome").join("User Data"))
            .into_iter()
            .collect()
    } else if cfg!(target_os = "macos") {
        dirs::home_dir()
            .map(|home| {
                home.join("Library")
                    .join("Application Support")
                    .join("Google")
                    .join("Chrome")
            })
            .into_iter()
            .collect()
    } else {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        ["google-chrome", "google-chrome-stable", "chromium"]
            .iter()
            .map(|browser| home.join(".config").join(browser))
            .collect()
    }
}

/// Finds `Default/Bookmarks` under a user-data directory, else the lowest-numbered `Profile N/Bookmarks`.
pub fn find_bookmarks_in(user_data_dir: &Path) -> Option<PathBuf> {
    let default = user_data_dir.join("Default").join("Bookmarks");
    if default.is_file() {
        return Some(default);
    }

    let entries = match fs::read_dir(user_data_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %user_data_dir.display(), error = %err, "cannot scan chrome profiles");
            return None;
        }
    };
    let mut profiles = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let number = name.strip_prefix("Profile ")?.trim().parse::<u32>().unwrap_or(u32::MAX);
            let bookmarks = entry.path().join("Bookmarks");
            bookmarks.is_file().then_some((number, name, bookmarks))
        })
        .collect::<Vec<_>>();
    profiles.sort();
    profiles.into_iter().next().map(|(_, _, path)| path)
}

pub fn locate_chrome_bookmarks() -> Option<PathBuf> {
    chrome_user_data_dirs()
        .iter()
        .filter(|dir| dir.is_dir())
        .find_map(|dir| find_bookmarks_in(dir))
}

// Takeout reading list discovery

/// Where Takeout exports usually land: the working directory, `~/Downloads` and `~/Desktop`.
pub fn reading_list_search_dirs() -> Vec<PathBuf> {
    let mut search = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        search.push(cwd);
    }
    if let Some(home) = dirs::home_dir() {
        search.push(home.join("Downloads"));
        search.push(home.join("Desktop"));
    }
    search
}

/// Most recently modified `Reading*.html` directly in a search dir or at
/// `Takeout*/Chrome/ReadingList.html` below one.
pub fn find_reading_list_in(search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    for dir in search_dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            if path.is_file() && name.starts_with("Reading") && name.ends_with(".html") {
                candidates.push(path);
            } else if path.is_dir() && name.starts_with("Takeout") {
                let export = path.join("Chrome").join("ReadingList.html");
                if export.is_file() {
                    candidates.push(export);
                }
            }
        }
    }
    candidates
        .into_iter()
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, path)| path)
}

pub fn locate_reading_list() -> Option<PathBuf> {
    let found = find_reading_list_in(&reading_list_search_dirs());
    if let Some(path) = &found {
        debug!(path = %path.display(), "found takeout reading list");
    }
    found
}

// Chrome bookmarks file

#[derive(Debug, Deserialize)]
struct RawBookmarkFile {
    #[serde(default)]
    roots: Option<BTreeMap<String, JsonValue>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    node_type: Option<String>,
    name: Option<String>,
    url: Option<String>,
    date_added: Option<JsonValue>,
    children: Option<Vec<JsonValue>>,
}

/// Parses a Chrome `Bookmarks` file into one root per entry of its `roots` map.
pub fn parse_chrome_bookmarks(text: &str) -> Result<(Forest, usize), AdapterError> {
    let file: RawBookmarkFile = serde_json::from_str(text).context("parsing chrome bookmarks json")?;
    let roots = file
        .roots
        .ok_or_else(|| AdapterError::Message("'roots' key not found in bookmarks file".to_string()))?;

    let mut malformed = 0usize;
    let forest = roots
        .iter()
        .map(|(label, value)| convert_root(label, value, &mut malformed))
        .collect();
    Ok((forest, malformed))
}

/// Chrome writes `date_added` as a decimal string of WebKit-epoch microseconds.
fn parse_webkit_date(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::String(text) => text.trim().parse().ok(),
        JsonValue::Number(number) => number.as_i64(),
        _ => None,
    }
}

fn convert_root(label: &str, value: &JsonValue, malformed: &mut usize) -> RootTree {
    let raw = RawNode::deserialize(value).unwrap_or_default();
    let date_added = parse_webkit_date(raw.date_added.as_ref());
    let name = raw.name.unwrap_or_else(|| label.to_string());
    let children = match (raw.node_type.as_deref(), raw.children) {
        (Some("folder"), Some(children)) => children
            .iter()
            .filter_map(|child| convert_node(child, malformed))
            .collect(),
        _ => {
            debug!(label, "root is empty or not a folder");
            Vec::new()
        }
    };
    RootTree::new(
        label,
        TreeNode::Folder {
            name,
            date_added,
            children,
        },
    )
}

fn convert_node(value: &JsonValue, malformed: &mut usize) -> Option<TreeNode> {
    let Ok(raw) = RawNode::deserialize(value) else {
        *malformed += 1;
        return None;
    };
    let RawNode {
        node_type,
        name,
        url,
        date_added,
        children,
    } = raw;
    let date_added = parse_webkit_date(date_added.as_ref());

    match (node_type.as_deref(), name, url, children) {
        (Some("url"), Some(name), Some(url), _) => Some(TreeNode::Link {
            name,
            url,
            date_added,
        }),
        (Some("folder"), Some(name), _, Some(children)) => Some(TreeNode::Folder {
            name,
            date_added,
            children: children
                .iter()
                .filter_map(|child| convert_node(child, malformed))
                .collect(),
        }),
        (node_type, name, _, _) => {
            debug!(?node_type, ?name, "dropping malformed bookmark node");
            *malformed += 1;
            None
        }
    }
}

// Reading list (Google Takeout ReadingList.html)

pub fn parse_reading_list_html(html: &str) -> Result<(Vec<TreeNode>, usize), AdapterError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a").map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut links = Vec::new();
    let mut malformed = 0usize;
    for anchor in document.select(&anchors) {
        let Some(url) = anchor.value().attr("href").and_then(|v| text_or_none(v.to_string())) else {
            malformed += 1;
            continue;
        };
        let name = text_or_none(anchor.text().collect::<String>()).unwrap_or_else(|| url.clone());
        let date_added = anchor
            .value()
            .attr("add_date")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(webkit_micros_from_unix_seconds);
        links.push(TreeNode::Link {
            name,
            url,
            date_added,
        });
    }
    Ok((links, malformed))
}

// Liked videos dump

#[derive(Debug, Deserialize)]
struct LikedVideo {
    title: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
}

pub fn parse_liked_videos(text: &str) -> Result<(Vec<TreeNode>, usize), AdapterError> {
    let entries: Vec<JsonValue> = serde_json::from_str(text).context("parsing liked videos json")?;
    let mut links = Vec::new();
    let mut malformed = 0usize;
    for entry in &entries {
        let video = match LikedVideo::deserialize(entry) {
            Ok(video) => video,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        let Some(url) = video
            .url
            .and_then(text_or_none)
            .filter(|url| url != "No URL")
        else {
            malformed += 1;
            continue;
        };
        let name = video.title.and_then(text_or_none).unwrap_or_else(|| url.clone());
        links.push(TreeNode::Link {
            name,
            url,
            date_added: rfc3339_to_webkit(video.published_at.as_deref()),
        });
    }
    Ok((links, malformed))
}

// Starred repositories dump

#[derive(Debug, Default, Deserialize)]
struct RepoFields {
    full_name: Option<String>,
    html_url: Option<String>,
    pushed_at: Option<String>,
}

/// Accepts both the plain repository shape and the `{starred_at, repo}` star+json shape.
#[derive(Debug, Deserialize)]
struct StarEntry {
    starred_at: Option<String>,
    repo: Option<RepoFields>,
    #[serde(flatten)]
    inline: RepoFields,
}

pub fn parse_github_stars(text: &str) -> Result<(Vec<TreeNode>, usize), AdapterError> {
    let entries: Vec<JsonValue> = serde_json::from_str(text).context("parsing github stars json")?;
    let mut links = Vec::new();
    let mut malformed = 0usize;
    for entry in &entries {
        let Ok(star) = StarEntry::deserialize(entry) else {
            malformed += 1;
            continue;
        };
        let repo = star.repo.unwrap_or(star.inline);
        let (Some(name), Some(url)) = (
            repo.full_name.and_then(text_or_none),
            repo.html_url.and_then(text_or_none),
        ) else {
            malformed += 1;
            continue;
        };
        let date_added = rfc3339_to_webkit(star.starred_at.as_deref())
            .or_else(|| rfc3339_to_webkit(repo.pushed_at.as_deref()));
        links.push(TreeNode::Link {
            name,
            url,
            date_added,
        });
    }
    Ok((links, malformed))
}
