use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{
    apply_sync, human_token, new_node_id, ordered_subtree, place, plan_copy, Channel,
    ContentError, ContentNode, ContentStore, CopyRequest, SyncOptions, UserChannels,
};
use crate::tasks::model::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Editor,
    Viewer,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<Uuid, User>,
    nodes: HashMap<String, ContentNode>,
    channels: HashMap<String, Channel>,
    members: Vec<(String, Uuid, Role)>,
    cache: HashMap<String, Value>,
}

impl State {
    fn children(&self, parent_id: &str) -> Vec<ContentNode> {
        self.nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    fn subtree(&self, node_id: &str) -> Vec<ContentNode> {
        let Some(root) = self.nodes.get(node_id) else {
            return Vec::new();
        };
        let tree = self
            .nodes
            .values()
            .filter(|n| n.tree_id == root.tree_id)
            .cloned()
            .collect();
        ordered_subtree(node_id, tree)
    }

    fn channel_of(&self, node: &ContentNode) -> Option<&Channel> {
        self.channels.values().find(|c| c.tree_id == node.tree_id)
    }
}

fn poison_err<T>(_: PoisonError<T>) -> ContentError {
    ContentError::Other(anyhow::anyhow!("content store lock poisoned"))
}

/// In-memory content, channels and users. Copies are atomic under one
/// write lock.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    state: RwLock<State>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) -> Result<(), ContentError> {
        self.state
            .write()
            .map_err(poison_err)?
            .users
            .insert(user.id, user);
        Ok(())
    }

    /// A channel with an empty root topic, edited by `editor`.
    pub fn add_channel(&self, name: &str, editor: Uuid) -> Result<Channel, ContentError> {
        let id = new_node_id();
        let tree_id = new_node_id();
        let root = ContentNode::new(new_node_id(), tree_id.clone(), name);
        let channel = Channel {
            id: id.clone(),
            name: name.to_string(),
            root_id: root.id.clone(),
            tree_id,
            version: 0,
            published: false,
            secret_token: None,
        };

        let mut state = self.state.write().map_err(poison_err)?;
        state.nodes.insert(root.id.clone(), root);
        state.channels.insert(id.clone(), channel.clone());
        state.members.push((id, editor, Role::Editor));
        Ok(channel)
    }

    pub fn add_member(&self, channel_id: &str, user_id: Uuid, role: Role) -> Result<(), ContentError> {
        self.state
            .write()
            .map_err(poison_err)?
            .members
            .push((channel_id.to_string(), user_id, role));
        Ok(())
    }

    /// Append a node under `parent_id`; `kind` is `topic`, `video`, ...
    pub fn add_node(&self, parent_id: &str, title: &str, kind: &str) -> Result<ContentNode, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let parent = state
            .nodes
            .get(parent_id)
            .cloned()
            .ok_or_else(|| ContentError::node_not_found(parent_id))?;
        let sort_order = state
            .children(parent_id)
            .iter()
            .map(|n| n.sort_order)
            .fold(0.0, f64::max)
            + 1.0;

        let mut node = ContentNode::new(new_node_id(), parent.tree_id, title);
        node.parent_id = Some(parent_id.to_string());
        node.kind = kind.to_string();
        node.sort_order = sort_order;
        state.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    pub fn put_node(&self, node: ContentNode) -> Result<(), ContentError> {
        self.state
            .write()
            .map_err(poison_err)?
            .nodes
            .insert(node.id.clone(), node);
        Ok(())
    }

    pub fn node_count(&self, id: &str) -> usize {
        self.state
            .read()
            .map(|s| s.nodes.values().filter(|n| n.id == id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ContentError> {
        Ok(self.state.read().map_err(poison_err)?.users.get(&user_id).cloned())
    }

    async fn get_node(&self, id: &str) -> Result<Option<ContentNode>, ContentError> {
        Ok(self.state.read().map_err(poison_err)?.nodes.get(id).cloned())
    }

    async fn can_edit_node(&self, user_id: Uuid, node_id: &str) -> Result<bool, ContentError> {
        let state = self.state.read().map_err(poison_err)?;
        let Some(node) = state.nodes.get(node_id) else {
            return Ok(false);
        };
        let Some(channel) = state.channel_of(node) else {
            return Ok(false);
        };
        Ok(state
            .members
            .iter()
            .any(|(c, u, r)| c == &channel.id && *u == user_id && *r == Role::Editor))
    }

    async fn copy_subtree(&self, req: CopyRequest) -> Result<ContentNode, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.nodes.contains_key(&req.pk) {
            return Err(ContentError::IdentifierTaken { id: req.pk });
        }

        let target = state
            .nodes
            .get(&req.target_id)
            .cloned()
            .ok_or_else(|| ContentError::node_not_found(&req.target_id))?;
        let subtree = state.subtree(&req.source_id);
        if subtree.is_empty() {
            return Err(ContentError::node_not_found(&req.source_id));
        }

        let siblings = if req.position.is_child() {
            state.children(&target.id)
        } else {
            target
                .parent_id
                .as_deref()
                .map(|p| state.children(p))
                .unwrap_or_default()
        };
        let placement = place(&target, req.position, &siblings)?;

        let copies = plan_copy(&subtree, &req, &placement);
        let root = copies[0].clone();
        for copy in copies {
            state.nodes.insert(copy.id.clone(), copy);
        }
        Ok(root)
    }

    async fn tree_nodes(&self, tree_id: &str) -> Result<Vec<ContentNode>, ContentError> {
        let state = self.state.read().map_err(poison_err)?;
        let nodes: Vec<ContentNode> = state
            .nodes
            .values()
            .filter(|n| n.tree_id == tree_id)
            .cloned()
            .collect();
        let root = nodes.iter().find(|n| n.parent_id.is_none()).map(|n| n.id.clone());
        Ok(match root {
            Some(root) => ordered_subtree(&root, nodes),
            None => nodes,
        })
    }

    async fn subtree(&self, node_id: &str) -> Result<Vec<ContentNode>, ContentError> {
        Ok(self.state.read().map_err(poison_err)?.subtree(node_id))
    }

    async fn delete_tree(&self, tree_id: &str) -> Result<u64, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let before = state.nodes.len();
        state.nodes.retain(|_, n| n.tree_id != tree_id);
        Ok((before - state.nodes.len()) as u64)
    }

    async fn sync_node(&self, node_id: &str, opts: SyncOptions) -> Result<bool, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let node = state
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| ContentError::node_not_found(node_id))?;
        let Some(source) = node
            .source_node_id
            .as_deref()
            .and_then(|s| state.nodes.get(s))
            .cloned()
        else {
            return Ok(false);
        };

        let mut updated = node;
        let changed = apply_sync(&mut updated, &source, opts);
        if changed {
            state.nodes.insert(updated.id.clone(), updated);
        }
        Ok(changed)
    }

    async fn get_channel(&self, id: &str) -> Result<Option<Channel>, ContentError> {
        Ok(self.state.read().map_err(poison_err)?.channels.get(id).cloned())
    }

    async fn channel_editors(&self, channel_id: &str) -> Result<Vec<User>, ContentError> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .members
            .iter()
            .filter(|(c, _, r)| c == channel_id && *r == Role::Editor)
            .filter_map(|(_, u, _)| state.users.get(u).cloned())
            .collect())
    }

    async fn user_channels(&self, user_id: Uuid) -> Result<UserChannels, ContentError> {
        let state = self.state.read().map_err(poison_err)?;
        let mut out = UserChannels::default();
        for (channel_id, u, role) in &state.members {
            if *u != user_id {
                continue;
            }
            if let Some(channel) = state.channels.get(channel_id) {
                match role {
                    Role::Editor => out.editable.push(channel.clone()),
                    Role::Viewer => out.view_only.push(channel.clone()),
                }
            }
        }
        Ok(out)
    }

    async fn mark_tree_published(&self, tree_id: &str) -> Result<u64, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut n = 0;
        for node in state.nodes.values_mut().filter(|n| n.tree_id == tree_id) {
            node.published = true;
            n += 1;
        }
        Ok(n)
    }

    async fn record_publish(
        &self,
        channel_id: &str,
        _version_notes: &str,
    ) -> Result<Channel, ContentError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ContentError::channel_not_found(channel_id))?;
        channel.version += 1;
        channel.published = true;
        if channel.secret_token.is_none() {
            channel.secret_token = Some(human_token());
        }
        Ok(channel.clone())
    }

    async fn put_cached_metadata(&self, key: &str, value: Value) -> Result<(), ContentError> {
        self.state
            .write()
            .map_err(poison_err)?
            .cache
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_cached_metadata(&self, key: &str) -> Result<Option<Value>, ContentError> {
        Ok(self.state.read().map_err(poison_err)?.cache.get(key).cloned())
    }
}
