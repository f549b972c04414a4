use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{ChangeEvent, HandlerError, ResourceKind, TaskContext, TaskResult, COPYING_FLAG};
use crate::content::{new_node_id, ContentError, CopyRequest, Position};

#[derive(Debug, Deserialize)]
pub struct DuplicateNodesArgs {
    pub target_id: String,
    pub source_id: String,
    #[serde(default)]
    pub pk: Option<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub mods: Option<Map<String, Value>>,
    #[serde(default)]
    pub excluded_descendants: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// Copy `source_id` relative to `target_id` under the pre-assigned `pk`.
///
/// A retried submission finds `pk` already taken. That counts as done when
/// the existing node is a copy of the same source under the same parent;
/// any other collision is an error and the existing node is left alone.
pub async fn duplicate_nodes(
    ctx: &TaskContext,
    args: DuplicateNodesArgs,
) -> Result<TaskResult, HandlerError> {
    let user_id = ctx.acting_user(args.user_id)?;
    let content = &ctx.services.content;

    let source = content
        .get_node(&args.source_id)
        .await?
        .ok_or_else(|| ContentError::node_not_found(&args.source_id))?;
    let target = content
        .get_node(&args.target_id)
        .await?
        .ok_or_else(|| ContentError::node_not_found(&args.target_id))?;

    if !content.can_edit_node(user_id, &target.id).await? {
        return Err(HandlerError::PermissionDenied(format!(
            "user {user_id} cannot edit node {}",
            target.id
        )));
    }
    let can_edit_source = content.can_edit_node(user_id, &source.id).await?;

    let pk = args.pk.unwrap_or_else(new_node_id);
    let req = CopyRequest {
        source_id: source.id.clone(),
        target_id: target.id.clone(),
        position: args.position,
        pk: pk.clone(),
        mods: args.mods.unwrap_or_default(),
        excluded_descendants: args.excluded_descendants.unwrap_or_default().into_iter().collect(),
        can_edit_source,
    };

    match content.copy_subtree(req).await {
        Ok(copy) => {
            tracing::debug!(task_id = %ctx.task_id, node_id = %copy.id, source_id = %source.id, "subtree copied");
        }
        Err(ContentError::IdentifierTaken { id }) => {
            let expected_parent = if args.position.is_child() {
                Some(target.id.clone())
            } else {
                target.parent_id.clone()
            };
            let existing = content.get_node(&id).await?;
            let same_copy = existing.is_some_and(|n| {
                n.source_node_id.as_deref() == Some(source.id.as_str())
                    && n.parent_id == expected_parent
            });
            if !same_copy {
                return Err(HandlerError::IdentifierConflict {
                    id,
                    source_id: source.id,
                });
            }
            tracing::info!(task_id = %ctx.task_id, node_id = %id, "copy already exists, treating as done");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(TaskResult::changes(vec![ChangeEvent::update(
        ResourceKind::ContentNode,
        pk,
        json!({ COPYING_FLAG: false }),
    )]))
}

#[derive(Debug, Deserialize)]
pub struct DeleteTreeArgs {
    pub tree_id: String,
}

pub async fn delete_tree(ctx: &TaskContext, args: DeleteTreeArgs) -> Result<(), HandlerError> {
    let deleted = ctx.services.content.delete_tree(&args.tree_id).await?;
    tracing::info!(tree_id = %args.tree_id, deleted, "tree deleted");
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct NodeDetailsArgs {
    pub node_id: String,
}

/// Summary of a node and everything under it.
pub async fn fetch_node_details(
    ctx: &TaskContext,
    args: NodeDetailsArgs,
) -> Result<TaskResult, HandlerError> {
    let subtree = ctx.services.content.subtree(&args.node_id).await?;
    let Some(root) = subtree.first() else {
        return Err(ContentError::node_not_found(&args.node_id).into());
    };

    let mut kinds: BTreeMap<&str, u64> = BTreeMap::new();
    let mut tags: BTreeSet<&str> = BTreeSet::new();
    let mut copyright_holders: BTreeSet<&str> = BTreeSet::new();
    let mut file_count = 0usize;
    let mut imported = 0u64;

    for node in subtree.iter().skip(1) {
        *kinds.entry(node.kind.as_str()).or_default() += 1;
        file_count += node.files.len();
        if node.source_node_id.is_some() {
            imported += 1;
        }
    }
    for node in &subtree {
        tags.extend(node.tags.iter().map(String::as_str));
        if let Some(holder) = node.copyright_holder.as_deref() {
            copyright_holders.insert(holder);
        }
    }
    let resource_count: u64 = kinds
        .iter()
        .filter(|(kind, _)| **kind != "topic")
        .map(|(_, n)| *n)
        .sum();

    Ok(TaskResult::data(json!({
        "node_id": root.id,
        "title": root.title,
        "resource_count": resource_count,
        "kind_count": kinds,
        "tags": tags,
        "copyright_holders": copyright_holders,
        "file_count": file_count,
        "imported_count": imported,
        "published": root.published,
    })))
}
