use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{ChangeEvent, HandlerError, ResourceKind, TaskContext, TaskResult};
use crate::content::{Channel, ContentError, Email, SyncOptions};

#[derive(Debug, Deserialize)]
pub struct ExportChannelArgs {
    pub channel_id: String,
    #[serde(default)]
    pub version_notes: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

async fn editable_channel(
    ctx: &TaskContext,
    user_id: Uuid,
    channel_id: &str,
) -> Result<Channel, HandlerError> {
    let content = &ctx.services.content;
    let channel = content
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| ContentError::channel_not_found(channel_id))?;
    if !content.can_edit_node(user_id, &channel.root_id).await? {
        return Err(HandlerError::PermissionDenied(format!(
            "user {user_id} cannot edit channel {channel_id}"
        )));
    }
    Ok(channel)
}

/// Publish a channel: flag its tree published, bump the version, make
/// sure it has a secret token and tell the editors.
pub async fn export_channel(
    ctx: &TaskContext,
    args: ExportChannelArgs,
) -> Result<TaskResult, HandlerError> {
    let user_id = ctx.acting_user(args.user_id)?;
    let content = &ctx.services.content;

    let channel = editable_channel(ctx, user_id, &args.channel_id).await?;
    ctx.report_progress(10.0).await;

    let published_nodes = content.mark_tree_published(&channel.tree_id).await?;
    ctx.report_progress(50.0).await;

    let channel = content
        .record_publish(&channel.id, &args.version_notes)
        .await?;
    ctx.report_progress(90.0).await;

    tracing::info!(
        task_id = %ctx.task_id,
        channel_id = %channel.id,
        version = channel.version,
        published_nodes,
        "channel published"
    );

    for editor in content.channel_editors(&channel.id).await? {
        let email = Email {
            to: editor.email,
            subject: format!("{} has been published", channel.name),
            body: format!(
                "Version {} of {} is now available.\n\n{}",
                channel.version, channel.name, args.version_notes
            ),
            attachments: Vec::new(),
        };
        if let Err(e) = ctx.services.mailer.send(email).await {
            tracing::warn!(channel_id = %channel.id, error = %e, "publish notification failed");
        }
    }

    Ok(TaskResult::changes(vec![ChangeEvent::update(
        ResourceKind::Channel,
        channel.id.clone(),
        json!({
            "published": true,
            "secret_token": channel.secret_token,
        }),
    )]))
}

#[derive(Debug, Deserialize)]
pub struct SyncChannelArgs {
    pub channel_id: String,
    #[serde(default)]
    pub sync_attributes: bool,
    #[serde(default)]
    pub sync_tags: bool,
    #[serde(default)]
    pub sync_files: bool,
    #[serde(default)]
    pub sync_assessment_items: bool,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// Refresh every imported node of the channel from the node it was
/// copied from.
pub async fn sync_channel(ctx: &TaskContext, args: SyncChannelArgs) -> Result<u64, HandlerError> {
    let user_id = ctx.acting_user(args.user_id)?;
    let content = &ctx.services.content;
    let channel = editable_channel(ctx, user_id, &args.channel_id).await?;

    let opts = SyncOptions {
        attributes: args.sync_attributes,
        tags: args.sync_tags,
        files: args.sync_files,
        assessment_items: args.sync_assessment_items,
    };

    let imported: Vec<String> = content
        .tree_nodes(&channel.tree_id)
        .await?
        .into_iter()
        .filter(|n| n.source_node_id.is_some())
        .map(|n| n.id)
        .collect();

    let total = imported.len();
    let mut changed = 0u64;
    for (i, node_id) in imported.iter().enumerate() {
        if content.sync_node(node_id, opts).await? {
            changed += 1;
        }
        ctx.report_progress(((i + 1) as f64 / total as f64) * 100.0).await;
    }

    tracing::info!(task_id = %ctx.task_id, channel_id = %channel.id, total, changed, "channel synced");
    Ok(changed)
}
