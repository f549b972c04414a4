use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use super::{HandlerError, TaskContext};
use crate::content::{ContentError, ContentNode, Email};

/// Rows are buffered in memory; exports are one channel or one user.
struct CsvBody(csv::Writer<Vec<u8>>);

impl CsvBody {
    fn new(header: &[&str]) -> Result<Self, HandlerError> {
        let mut body = Self(csv::Writer::from_writer(Vec::new()));
        body.row(header)?;
        Ok(body)
    }

    fn row(&mut self, fields: &[&str]) -> Result<(), HandlerError> {
        self.0
            .write_record(fields)
            .map_err(|e| HandlerError::Internal(e.into()))
    }

    fn into_bytes(self) -> Result<Vec<u8>, HandlerError> {
        self.0
            .into_inner()
            .map_err(|e| HandlerError::Internal(anyhow::anyhow!("flushing csv: {}", e.error())))
    }
}

async fn write_csv(dir: &Path, name: &str, body: CsvBody) -> Result<PathBuf, HandlerError> {
    let bytes = body.into_bytes()?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| HandlerError::Internal(e.into()))?;
    let path = dir.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| HandlerError::Internal(e.into()))?;
    Ok(path)
}

fn node_path(node: &ContentNode, by_id: &HashMap<&str, &ContentNode>) -> String {
    let mut titles = Vec::new();
    let mut parent = node.parent_id.as_deref();
    while let Some(id) = parent {
        let Some(p) = by_id.get(id) else { break };
        // the root topic carries the channel name, not a folder
        if p.parent_id.is_some() {
            titles.push(p.title.as_str());
        }
        parent = p.parent_id.as_deref();
    }
    titles.reverse();
    titles.join(" > ")
}

#[derive(Debug, Deserialize)]
pub struct ChannelCsvArgs {
    pub channel_id: String,
    pub domain: String,
    pub user_id: Uuid,
}

pub async fn generate_channel_csv(ctx: &TaskContext, args: ChannelCsvArgs) -> Result<PathBuf, HandlerError> {
    let content = &ctx.services.content;
    let channel = content
        .get_channel(&args.channel_id)
        .await?
        .ok_or_else(|| ContentError::channel_not_found(&args.channel_id))?;
    let user = content.get_user(args.user_id).await?.ok_or_else(|| HandlerError::NotFound {
        entity: "user",
        id: args.user_id.to_string(),
    })?;

    let nodes = content.tree_nodes(&channel.tree_id).await?;
    let by_id: HashMap<&str, &ContentNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let domain = args.domain.trim_end_matches('/');

    let mut body = CsvBody::new(&[
        "Title",
        "Description",
        "Kind",
        "Path",
        "Tags",
        "Files",
        "Copyright Holder",
        "Link",
    ])?;
    for node in nodes.iter().filter(|n| n.parent_id.is_some()) {
        let path = node_path(node, &by_id);
        let tags = node.tags.join(", ");
        let files = node.files.len().to_string();
        let link = format!("{domain}/channels/{}/{}", channel.id, node.id);
        body.row(&[
            &node.title,
            &node.description,
            &node.kind,
            &path,
            &tags,
            &files,
            node.copyright_holder.as_deref().unwrap_or(""),
            &link,
        ])?;
    }

    let path = write_csv(&ctx.services.exports_dir, &format!("{}.csv", channel.id), body).await?;

    ctx.services
        .mailer
        .send(Email {
            to: user.email,
            subject: format!("CSV export for {}", channel.name),
            body: format!("Attached is the CSV of all content in {}.", channel.name),
            attachments: vec![path.clone()],
        })
        .await?;

    Ok(path)
}

#[derive(Debug, Deserialize)]
pub struct UserCsvArgs {
    pub user_id: Uuid,
}

pub async fn generate_user_csv(ctx: &TaskContext, args: UserCsvArgs) -> Result<PathBuf, HandlerError> {
    let content = &ctx.services.content;
    let user = content.get_user(args.user_id).await?.ok_or_else(|| HandlerError::NotFound {
        entity: "user",
        id: args.user_id.to_string(),
    })?;
    let channels = content.user_channels(user.id).await?;

    let mut body = CsvBody::new(&["Channel", "Channel ID", "Access", "Version", "Published"])?;
    let rows = channels
        .editable
        .iter()
        .map(|c| (c, "edit"))
        .chain(channels.view_only.iter().map(|c| (c, "view")));
    for (channel, access) in rows {
        let version = channel.version.to_string();
        let published = if channel.published { "yes" } else { "no" };
        body.row(&[&channel.name, &channel.id, access, &version, published])?;
    }

    let path = write_csv(&ctx.services.exports_dir, &format!("user_{}.csv", user.id), body).await?;

    ctx.services
        .mailer
        .send(Email {
            to: user.email,
            subject: "Your account data".to_string(),
            body: format!(
                "Attached is a list of the {} channel(s) you can edit and the {} you can view.",
                channels.editable.len(),
                channels.view_only.len()
            ),
            attachments: vec![path.clone()],
        })
        .await?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fields_that_need_it_are_quoted() {
        let mut body = CsvBody::new(&["Title", "Notes"]).unwrap();
        body.row(&["plain", "a,b"]).unwrap();
        body.row(&["say \"hi\"", ""]).unwrap();
        let text = String::from_utf8(body.into_bytes().unwrap()).unwrap();
        assert_eq!(text, "Title,Notes\nplain,\"a,b\"\n\"say \"\"hi\"\"\",\n");
    }

    #[test]
    fn rows_must_match_the_header_width() {
        let mut body = CsvBody::new(&["a", "b"]).unwrap();
        assert!(matches!(body.row(&["only one"]), Err(HandlerError::Internal(_))));
    }

    #[test]
    fn path_skips_the_channel_root() {
        let root = ContentNode::new("r", "t", "Channel");
        let mut unit = ContentNode::new("u", "t", "Unit 1");
        unit.parent_id = Some("r".into());
        let mut leaf = ContentNode::new("l", "t", "Video");
        leaf.parent_id = Some("u".into());

        let by_id: HashMap<&str, &ContentNode> =
            [("r", &root), ("u", &unit), ("l", &leaf)].into_iter().collect();
        assert_eq!(node_path(&leaf, &by_id), "Unit 1");
        assert_eq!(node_path(&unit, &by_id), "");
    }
}
