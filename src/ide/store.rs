//! Read-only adapter over the IDE's workspace-storage SQLite database.
//!
//! The IDE owns the file and is its sole writer; this side opens it
//! read-only and treats `database is locked` as "no data this tick".
//! Conversations live as one JSON blob under the `composer.composerData`
//! key of `ItemTable`.

use crate::error::{BridgeError, Result};
use crate::ConversationId;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const COMPOSER_DATA_KEY: &str = "composer.composerData";

/// One row of the recency ranking: position 0 is the most recent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedConversation {
    pub id: ConversationId,
    pub last_updated_at: Option<i64>,
    pub position: usize,
}

/// What the watchers need from the IDE's conversation list.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Every conversation id, archived or not.
    async fn all_ids(&self) -> Result<Vec<ConversationId>>;

    /// `None` for missing, empty, or whitespace-only names.
    async fn name_of(&self, id: &ConversationId) -> Result<Option<String>>;

    /// All non-empty names.
    async fn all_names(&self) -> Result<HashMap<ConversationId, String>>;

    async fn archived_ids(&self) -> Result<HashSet<ConversationId>>;

    /// Non-archived conversations in descending recency, nulls last.
    async fn active_ranked_by_recency(&self) -> Result<Vec<RankedConversation>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComposerData {
    #[serde(default)]
    all_composers: Vec<ComposerRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComposerRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    last_updated_at: Option<i64>,
    #[serde(default)]
    is_archived: bool,
}

impl ComposerRecord {
    fn clean_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

pub struct ComposerStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl ComposerStore {
    /// Open the state database read-only.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            db_path: db_path.to_owned(),
        })
    }

    /// Discover this workspace's state database by scanning the
    /// platform workspace-storage directory for a `workspace.json`
    /// naming the workspace root.
    pub fn discover_state_db(workspace_root: &Path) -> Result<PathBuf> {
        let base = workspace_storage_base().ok_or_else(|| {
            BridgeError::NotFound("platform workspace storage directory".into())
        })?;
        let root = workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_owned());

        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            let marker = entry.path().join("workspace.json");
            let Ok(contents) = std::fs::read_to_string(&marker) else {
                continue;
            };
            let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) else {
                continue;
            };
            let Some(folder) = json.get("folder").and_then(serde_json::Value::as_str) else {
                continue;
            };
            if folder_uri_matches(folder, &root) {
                let db = entry.path().join("state.vscdb");
                if db.exists() {
                    return Ok(db);
                }
            }
        }

        Err(BridgeError::NotFound(format!(
            "workspace storage for {}",
            workspace_root.display()
        )))
    }

    /// Paths the name-sync watcher should observe: the database and its
    /// write-ahead log.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let mut wal = self.db_path.as_os_str().to_owned();
        wal.push("-wal");
        vec![self.db_path.clone(), PathBuf::from(wal)]
    }

    async fn read_blob(&self) -> Result<ComposerData> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT value FROM ItemTable WHERE key = ?")
                .bind(COMPOSER_DATA_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlite_error)?;
        match row {
            Some(json) => Ok(parse_composer_data(&json)?),
            None => Ok(ComposerData::default()),
        }
    }
}

fn map_sqlite_error(error: sqlx::Error) -> BridgeError {
    if let sqlx::Error::Database(db) = &error
        && db.message().contains("locked")
    {
        return BridgeError::Locked;
    }
    error.into()
}

fn parse_composer_data(json: &str) -> Result<ComposerData> {
    Ok(serde_json::from_str(json)?)
}

/// Platform base directory holding `workspaceStorage/<hash>/`.
pub fn workspace_storage_base() -> Option<PathBuf> {
    let override_dir = std::env::var_os("BRIDGEBOT_WORKSPACE_STORAGE");
    if let Some(dir) = override_dir {
        return Some(PathBuf::from(dir));
    }
    Some(dirs::config_dir()?.join("Cursor").join("User").join("workspaceStorage"))
}

/// Match a `workspace.json` `file://` URI against an absolute root.
fn folder_uri_matches(folder_uri: &str, root: &Path) -> bool {
    let Some(encoded) = folder_uri.strip_prefix("file://") else {
        return false;
    };
    let decoded = percent_decode(encoded);
    let candidate = PathBuf::from(decoded);
    let candidate = candidate.canonicalize().unwrap_or(candidate);
    candidate == root
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let Ok(hex) = std::str::from_utf8(&bytes[index + 1..index + 3])
            && let Ok(value) = u8::from_str_radix(hex, 16)
        {
            out.push(value);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl ConversationSource for ComposerStore {
    async fn all_ids(&self) -> Result<Vec<ConversationId>> {
        let data = self.read_blob().await?;
        Ok(data
            .all_composers
            .into_iter()
            .map(|record| ConversationId(record.id))
            .collect())
    }

    async fn name_of(&self, id: &ConversationId) -> Result<Option<String>> {
        let data = self.read_blob().await?;
        Ok(data
            .all_composers
            .iter()
            .find(|record| record.id == id.as_str())
            .and_then(|record| record.clean_name().map(str::to_owned)))
    }

    async fn all_names(&self) -> Result<HashMap<ConversationId, String>> {
        let data = self.read_blob().await?;
        Ok(data
            .all_composers
            .iter()
            .filter_map(|record| {
                record
                    .clean_name()
                    .map(|name| (ConversationId(record.id.clone()), name.to_owned()))
            })
            .collect())
    }

    async fn archived_ids(&self) -> Result<HashSet<ConversationId>> {
        let data = self.read_blob().await?;
        Ok(data
            .all_composers
            .into_iter()
            .filter(|record| record.is_archived)
            .map(|record| ConversationId(record.id))
            .collect())
    }

    async fn active_ranked_by_recency(&self) -> Result<Vec<RankedConversation>> {
        let data = self.read_blob().await?;
        Ok(rank_by_recency(&data))
    }
}

fn rank_by_recency(data: &ComposerData) -> Vec<RankedConversation> {
    let mut active: Vec<&ComposerRecord> = data
        .all_composers
        .iter()
        .filter(|record| !record.is_archived)
        .collect();
    // Descending recency; conversations without a timestamp sort last.
    active.sort_by_key(|record| std::cmp::Reverse(record.last_updated_at.unwrap_or(i64::MIN)));
    active
        .into_iter()
        .enumerate()
        .map(|(position, record)| RankedConversation {
            id: ConversationId(record.id.clone()),
            last_updated_at: record.last_updated_at,
            position,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composer_blob_parses() {
        let json = r#"{
            "allComposers": [
                {"id": "C1", "name": "Refactor parser", "createdAt": 1, "lastUpdatedAt": 10, "unifiedMode": "agent", "isArchived": false, "isDraft": false},
                {"id": "C2", "name": "  ", "lastUpdatedAt": 5, "isArchived": true},
                {"id": "C3"}
            ]
        }"#;
        let data = parse_composer_data(json).unwrap();
        assert_eq!(data.all_composers.len(), 3);
        assert_eq!(data.all_composers[0].clean_name(), Some("Refactor parser"));
        assert_eq!(data.all_composers[1].clean_name(), None);
        assert_eq!(data.all_composers[2].clean_name(), None);
        assert!(data.all_composers[1].is_archived);
    }

    #[test]
    fn empty_blob_is_no_conversations() {
        let data = parse_composer_data("{}").unwrap();
        assert!(data.all_composers.is_empty());
    }

    #[test]
    fn ranking_is_descending_with_nulls_last() {
        let data = parse_composer_data(
            r#"{"allComposers": [
                {"id": "A", "lastUpdatedAt": 100},
                {"id": "B"},
                {"id": "C", "lastUpdatedAt": 300},
                {"id": "D", "lastUpdatedAt": 200, "isArchived": true}
            ]}"#,
        )
        .unwrap();
        let ranked = rank_by_recency(&data);
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(ranked[0].position, 0);
        assert_eq!(ranked[2].position, 2);
        assert_eq!(ranked[2].last_updated_at, None);
    }

    #[test]
    fn folder_uri_matching() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let uri = format!("file://{}", root.display());
        assert!(folder_uri_matches(&uri, &root));
        assert!(!folder_uri_matches("file:///somewhere/else", &root));
        assert!(!folder_uri_matches("vscode-remote://x", &root));
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("/a%20b/c"), "/a b/c");
        assert_eq!(percent_decode("/plain"), "/plain");
        assert_eq!(percent_decode("/bad%zz"), "/bad%zz");
    }
}
