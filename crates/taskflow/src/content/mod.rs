//! Domain collaborators the job handlers call into: content trees,
//! channels, the metadata cache and outgoing mail.
//!
//! Handlers only see these traits. `memory` backs tests and local runs;
//! `pg` backs the worker.

pub mod mailer;
pub mod memory;
pub mod pg;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::tasks::model::User;

pub use mailer::{Email, LogMailer, Mailer, RecordingMailer};
pub use memory::MemoryContentStore;
pub use pg::PgContentStore;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("a node with id {id} already exists")]
    IdentifierTaken { id: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ContentError {
    pub fn node_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "content node",
            id: id.to_string(),
        }
    }

    pub fn channel_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "channel",
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for ContentError {
    fn from(err: sqlx::Error) -> Self {
        ContentError::Other(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentNode {
    pub id: String,
    pub tree_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub kind: String,
    pub sort_order: f64,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    pub assessment_items: Vec<String>,
    /// Only carried into a copy when the copier can edit the source.
    pub copyright_holder: Option<String>,
    pub source_node_id: Option<String>,
    pub published: bool,
}

impl ContentNode {
    pub fn new(id: impl Into<String>, tree_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tree_id: tree_id.into(),
            parent_id: None,
            title: title.into(),
            description: String::new(),
            kind: "topic".to_string(),
            sort_order: 1.0,
            tags: Vec::new(),
            files: Vec::new(),
            assessment_items: Vec::new(),
            copyright_holder: None,
            source_node_id: None,
            published: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub root_id: String,
    pub tree_id: String,
    pub version: i32,
    pub published: bool,
    pub secret_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserChannels {
    pub editable: Vec<Channel>,
    pub view_only: Vec<Channel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    FirstChild,
    #[default]
    LastChild,
    Left,
    Right,
}

impl Position {
    pub fn is_child(&self) -> bool {
        matches!(self, Position::FirstChild | Position::LastChild)
    }
}

#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source_id: String,
    pub target_id: String,
    pub position: Position,
    pub pk: String,
    pub mods: Map<String, Value>,
    pub excluded_descendants: HashSet<String>,
    pub can_edit_source: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub attributes: bool,
    pub tags: bool,
    pub files: bool,
    pub assessment_items: bool,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ContentError>;

    async fn get_node(&self, id: &str) -> Result<Option<ContentNode>, ContentError>;

    async fn can_edit_node(&self, user_id: Uuid, node_id: &str) -> Result<bool, ContentError>;

    /// Copy `source_id` and its descendants next to or under `target_id`.
    /// Fails with `IdentifierTaken` when `pk` already exists; never
    /// overwrites.
    async fn copy_subtree(&self, req: CopyRequest) -> Result<ContentNode, ContentError>;

    /// Nodes of a tree, parents before children.
    async fn tree_nodes(&self, tree_id: &str) -> Result<Vec<ContentNode>, ContentError>;

    /// A node and all of its descendants, the node first.
    async fn subtree(&self, node_id: &str) -> Result<Vec<ContentNode>, ContentError>;

    async fn delete_tree(&self, tree_id: &str) -> Result<u64, ContentError>;

    async fn sync_node(&self, node_id: &str, opts: SyncOptions) -> Result<bool, ContentError>;

    async fn get_channel(&self, id: &str) -> Result<Option<Channel>, ContentError>;

    async fn channel_editors(&self, channel_id: &str) -> Result<Vec<User>, ContentError>;

    async fn user_channels(&self, user_id: Uuid) -> Result<UserChannels, ContentError>;

    async fn mark_tree_published(&self, tree_id: &str) -> Result<u64, ContentError>;

    /// Bump the channel version, flag it published and issue a secret token
    /// if it has none.
    async fn record_publish(
        &self,
        channel_id: &str,
        version_notes: &str,
    ) -> Result<Channel, ContentError>;

    async fn put_cached_metadata(&self, key: &str, value: Value) -> Result<(), ContentError>;

    async fn get_cached_metadata(&self, key: &str) -> Result<Option<Value>, ContentError>;
}

/// Everything a handler may touch besides its task record.
#[derive(Clone)]
pub struct Services {
    pub content: Arc<dyn ContentStore>,
    pub mailer: Arc<dyn Mailer>,
    pub exports_dir: PathBuf,
}

impl Services {
    pub fn new(content: Arc<dyn ContentStore>, mailer: Arc<dyn Mailer>, exports_dir: PathBuf) -> Self {
        Self {
            content,
            mailer,
            exports_dir,
        }
    }
}

pub fn new_node_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ten lowercase letters split in two, e.g. `kzbqa-mvtre`.
pub fn human_token() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..10)
        .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
        .collect();
    format!("{}-{}", &letters[..5], &letters[5..])
}

/// Where a copy lands: its parent and its sort order among siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub parent_id: String,
    pub tree_id: String,
    pub sort_order: f64,
}

/// Resolve a position relative to `target`. `siblings` are the children
/// of the placement parent, excluding nothing.
pub fn place(
    target: &ContentNode,
    position: Position,
    siblings: &[ContentNode],
) -> Result<Placement, ContentError> {
    let orders = siblings.iter().map(|n| n.sort_order);
    match position {
        Position::FirstChild => Ok(Placement {
            parent_id: target.id.clone(),
            tree_id: target.tree_id.clone(),
            sort_order: orders.fold(f64::INFINITY, f64::min).min(2.0) - 1.0,
        }),
        Position::LastChild => Ok(Placement {
            parent_id: target.id.clone(),
            tree_id: target.tree_id.clone(),
            sort_order: orders.fold(0.0, f64::max) + 1.0,
        }),
        Position::Left | Position::Right => {
            let parent_id = target.parent_id.clone().ok_or_else(|| {
                ContentError::Invalid(format!("cannot place a sibling of root node {}", target.id))
            })?;
            let neighbour = if position == Position::Left {
                siblings
                    .iter()
                    .map(|n| n.sort_order)
                    .filter(|o| *o < target.sort_order)
                    .fold(target.sort_order - 2.0, f64::max)
            } else {
                siblings
                    .iter()
                    .map(|n| n.sort_order)
                    .filter(|o| *o > target.sort_order)
                    .fold(target.sort_order + 2.0, f64::min)
            };
            Ok(Placement {
                parent_id,
                tree_id: target.tree_id.clone(),
                sort_order: (target.sort_order + neighbour) / 2.0,
            })
        }
    }
}

/// Build the copies for `subtree` (source first, parents before children).
/// Excluded descendants are skipped together with everything below them.
pub fn plan_copy(
    subtree: &[ContentNode],
    req: &CopyRequest,
    placement: &Placement,
) -> Vec<ContentNode> {
    let mut new_ids: HashMap<&str, String> = HashMap::new();
    let mut copies = Vec::with_capacity(subtree.len());

    for (i, node) in subtree.iter().enumerate() {
        let is_root = i == 0;
        if !is_root && req.excluded_descendants.contains(&node.id) {
            continue;
        }

        let parent_id = if is_root {
            placement.parent_id.clone()
        } else {
            match node.parent_id.as_deref().and_then(|p| new_ids.get(p)) {
                Some(p) => p.clone(),
                // parent was excluded
                None => continue,
            }
        };

        let id = if is_root { req.pk.clone() } else { new_node_id() };
        new_ids.insert(node.id.as_str(), id.clone());

        let mut copy = ContentNode {
            id,
            tree_id: placement.tree_id.clone(),
            parent_id: Some(parent_id),
            sort_order: if is_root {
                placement.sort_order
            } else {
                node.sort_order
            },
            copyright_holder: if req.can_edit_source {
                node.copyright_holder.clone()
            } else {
                None
            },
            source_node_id: Some(node.id.clone()),
            published: false,
            ..node.clone()
        };
        if is_root {
            apply_mods(&mut copy, &req.mods);
        }
        copies.push(copy);
    }

    copies
}

fn apply_mods(node: &mut ContentNode, mods: &Map<String, Value>) {
    if let Some(title) = mods.get("title").and_then(Value::as_str) {
        node.title = title.to_string();
    }
    if let Some(description) = mods.get("description").and_then(Value::as_str) {
        node.description = description.to_string();
    }
    if let Some(tags) = mods.get("tags").and_then(Value::as_array) {
        node.tags = tags
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
}

/// Refresh `node` from the node it was imported from. Returns whether
/// anything changed.
pub fn apply_sync(node: &mut ContentNode, source: &ContentNode, opts: SyncOptions) -> bool {
    let before = node.clone();
    if opts.attributes {
        node.title = source.title.clone();
        node.description = source.description.clone();
        node.copyright_holder = source.copyright_holder.clone();
    }
    if opts.tags {
        node.tags = source.tags.clone();
    }
    if opts.files {
        node.files = source.files.clone();
    }
    if opts.assessment_items {
        node.assessment_items = source.assessment_items.clone();
    }
    *node != before
}

/// Order a flat node list so parents precede children, starting at `root`.
pub fn ordered_subtree(root: &str, nodes: Vec<ContentNode>) -> Vec<ContentNode> {
    let mut children: HashMap<String, Vec<ContentNode>> = HashMap::new();
    let mut root_node = None;
    for node in nodes {
        if node.id == root {
            root_node = Some(node);
        } else if let Some(parent) = node.parent_id.clone() {
            children.entry(parent).or_default().push(node);
        }
    }

    let Some(root_node) = root_node else {
        return Vec::new();
    };

    let mut out = vec![root_node];
    let mut i = 0;
    while i < out.len() {
        if let Some(mut kids) = children.remove(&out[i].id) {
            kids.sort_by(|a, b| a.sort_order.total_cmp(&b.sort_order));
            out.extend(kids);
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, parent: Option<&str>, order: f64) -> ContentNode {
        let mut n = ContentNode::new(id, "tree", id);
        n.parent_id = parent.map(str::to_string);
        n.sort_order = order;
        n
    }

    fn request(pk: &str) -> CopyRequest {
        CopyRequest {
            source_id: "s".into(),
            target_id: "t".into(),
            position: Position::LastChild,
            pk: pk.into(),
            mods: Map::new(),
            excluded_descendants: HashSet::new(),
            can_edit_source: false,
        }
    }

    #[test]
    fn last_child_goes_after_existing_children() {
        let target = node("t", None, 1.0);
        let kids = vec![node("a", Some("t"), 1.0), node("b", Some("t"), 4.0)];
        let p = place(&target, Position::LastChild, &kids).unwrap();
        assert_eq!(p.parent_id, "t");
        assert_eq!(p.sort_order, 5.0);

        let p = place(&target, Position::FirstChild, &kids).unwrap();
        assert_eq!(p.sort_order, 0.0);
    }

    #[test]
    fn siblings_land_between_neighbours() {
        let target = node("b", Some("p"), 2.0);
        let sibs = vec![node("a", Some("p"), 1.0), target.clone(), node("c", Some("p"), 3.0)];
        assert_eq!(place(&target, Position::Left, &sibs).unwrap().sort_order, 1.5);
        assert_eq!(place(&target, Position::Right, &sibs).unwrap().sort_order, 2.5);

        let root = node("r", None, 1.0);
        assert!(matches!(
            place(&root, Position::Left, &[]),
            Err(ContentError::Invalid(_))
        ));
    }

    #[test]
    fn plan_skips_excluded_branches_and_restricted_fields() {
        let mut src = node("s", Some("x"), 1.0);
        src.copyright_holder = Some("Owner".into());
        let subtree = vec![
            src,
            node("k1", Some("s"), 1.0),
            node("k2", Some("s"), 2.0),
            node("g1", Some("k2"), 1.0),
        ];
        let mut req = request("P");
        req.excluded_descendants.insert("k2".into());
        req.mods = json!({"title": "Copy"}).as_object().cloned().unwrap();

        let placement = Placement {
            parent_id: "t".into(),
            tree_id: "tree2".into(),
            sort_order: 3.0,
        };
        let copies = plan_copy(&subtree, &req, &placement);

        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].id, "P");
        assert_eq!(copies[0].title, "Copy");
        assert_eq!(copies[0].parent_id.as_deref(), Some("t"));
        assert_eq!(copies[0].copyright_holder, None);
        assert_eq!(copies[0].source_node_id.as_deref(), Some("s"));
        assert_eq!(copies[1].parent_id.as_deref(), Some("P"));
        assert_eq!(copies[1].tree_id, "tree2");
    }

    #[test]
    fn sync_reports_changes_only_for_selected_fields() {
        let mut target = node("n", None, 1.0);
        let mut source = node("s", None, 1.0);
        source.tags = vec!["math".into()];
        source.title = "New".into();

        let opts = SyncOptions {
            tags: true,
            ..SyncOptions::default()
        };
        assert!(apply_sync(&mut target, &source, opts));
        assert_eq!(target.tags, vec!["math".to_string()]);
        assert_eq!(target.title, "n");
        assert!(!apply_sync(&mut target, &source, opts));
    }

    #[test]
    fn human_tokens_have_two_halves() {
        let token = human_token();
        assert_eq!(token.len(), 11);
        assert_eq!(token.as_bytes()[5], b'-');
    }
}
