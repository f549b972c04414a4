use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{HandlerError, TaskContext};
use crate::content::ContentNode;

pub fn channel_key(channel_id: &str) -> String {
    format!("channel_metadata:{channel_id}")
}

pub fn user_key(user_id: Uuid) -> String {
    format!("user_metadata:{user_id}")
}

fn tree_summary(channel_id: &str, nodes: &[ContentNode]) -> Value {
    let resources = nodes
        .iter()
        .filter(|n| n.parent_id.is_some() && n.kind != "topic")
        .count();
    let files: usize = nodes.iter().map(|n| n.files.len()).sum();
    let tags: BTreeSet<&str> = nodes
        .iter()
        .flat_map(|n| n.tags.iter().map(String::as_str))
        .collect();
    json!({
        "channel_id": channel_id,
        "node_count": nodes.len(),
        "resource_count": resources,
        "file_count": files,
        "tags": tags,
        "computed_at": chrono::Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ChannelMetadataArgs {
    pub key: String,
    pub channel_id: String,
    pub tree_id: String,
}

pub async fn cache_channel_metadata(
    ctx: &TaskContext,
    args: ChannelMetadataArgs,
) -> Result<(), HandlerError> {
    let content = &ctx.services.content;
    let nodes = content.tree_nodes(&args.tree_id).await?;
    content
        .put_cached_metadata(&args.key, tree_summary(&args.channel_id, &nodes))
        .await?;
    tracing::debug!(key = %args.key, nodes = nodes.len(), "channel metadata cached");
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ChannelsMetadataArgs {
    pub channel_ids: Vec<String>,
}

/// Refresh the cached summary of every listed channel. Channels that no
/// longer exist are skipped.
pub async fn cache_channels_metadata(
    ctx: &TaskContext,
    args: ChannelsMetadataArgs,
) -> Result<usize, HandlerError> {
    let content = &ctx.services.content;
    let mut cached = 0;
    for channel_id in &args.channel_ids {
        let Some(channel) = content.get_channel(channel_id).await? else {
            tracing::warn!(channel_id = %channel_id, "skipping missing channel");
            continue;
        };
        cache_channel_metadata(
            ctx,
            ChannelMetadataArgs {
                key: channel_key(&channel.id),
                channel_id: channel.id,
                tree_id: channel.tree_id,
            },
        )
        .await?;
        cached += 1;
    }
    Ok(cached)
}

#[derive(Debug, Deserialize)]
pub struct UsersMetadataArgs {
    pub user_ids: Vec<Uuid>,
}

pub async fn cache_users_metadata(
    ctx: &TaskContext,
    args: UsersMetadataArgs,
) -> Result<usize, HandlerError> {
    let content = &ctx.services.content;
    let mut cached = 0;
    for user_id in args.user_ids {
        let user = match content.get_user(user_id).await? {
            Some(user) => user,
            None => {
                tracing::warn!(%user_id, "skipping missing user");
                continue;
            }
        };
        let channels = content.user_channels(user.id).await?;
        let value = json!({
            "user_id": user.id,
            "email": user.email,
            "editable_channel_count": channels.editable.len(),
            "view_only_channel_count": channels.view_only.len(),
            "computed_at": chrono::Utc::now(),
        });
        content.put_cached_metadata(&user_key(user.id), value).await?;
        cached += 1;
    }
    Ok(cached)
}
