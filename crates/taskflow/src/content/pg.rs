// crates/taskflow/src/content/pg.rs

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    apply_sync, human_token, ordered_subtree, place, plan_copy, Channel, ContentError,
    ContentNode, ContentStore, CopyRequest, SyncOptions, UserChannels,
};
use crate::tasks::model::User;

const NODE_COLUMNS: &str = r#"
    id, tree_id, parent_id, title, description, kind, sort_order,
    tags, files, assessment_items, copyright_holder, source_node_id, published
"#;

const CHANNEL_COLUMNS: &str = "id, name, root_id, tree_id, version, published, secret_token";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn children(&self, parent_id: &str) -> Result<Vec<ContentNode>, ContentError> {
        let rows = sqlx::query_as::<_, ContentNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes WHERE parent_id = $1"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ContentError> {
        let user = sqlx::query_as::<_, User>("SELECT id, email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_node(&self, id: &str) -> Result<Option<ContentNode>, ContentError> {
        let node = sqlx::query_as::<_, ContentNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(node)
    }

    async fn can_edit_node(&self, user_id: Uuid, node_id: &str) -> Result<bool, ContentError> {
        let can_edit: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM content_nodes n
                JOIN channels c ON c.tree_id = n.tree_id
                JOIN channel_members m ON m.channel_id = c.id
                WHERE n.id = $1
                  AND m.user_id = $2
                  AND m.role = 'editor'
            )
            "#,
        )
        .bind(node_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(can_edit)
    }

    async fn copy_subtree(&self, req: CopyRequest) -> Result<ContentNode, ContentError> {
        let target = self
            .get_node(&req.target_id)
            .await?
            .ok_or_else(|| ContentError::node_not_found(&req.target_id))?;
        let subtree = self.subtree(&req.source_id).await?;
        if subtree.is_empty() {
            return Err(ContentError::node_not_found(&req.source_id));
        }

        let siblings = if req.position.is_child() {
            self.children(&target.id).await?
        } else {
            match target.parent_id.as_deref() {
                Some(parent) => self.children(parent).await?,
                None => Vec::new(),
            }
        };
        let placement = place(&target, req.position, &siblings)?;
        let copies = plan_copy(&subtree, &req, &placement);

        let mut tx = self.pool.begin().await?;
        for copy in &copies {
            let res = sqlx::query(
                r#"
                INSERT INTO content_nodes (
                    id, tree_id, parent_id, title, description, kind, sort_order,
                    tags, files, assessment_items, copyright_holder, source_node_id, published
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(&copy.id)
            .bind(&copy.tree_id)
            .bind(&copy.parent_id)
            .bind(&copy.title)
            .bind(&copy.description)
            .bind(&copy.kind)
            .bind(copy.sort_order)
            .bind(&copy.tags)
            .bind(&copy.files)
            .bind(&copy.assessment_items)
            .bind(&copy.copyright_holder)
            .bind(&copy.source_node_id)
            .bind(copy.published)
            .execute(&mut *tx)
            .await;

            if let Err(e) = res {
                if copy.id == req.pk && is_unique_violation(&e) {
                    return Err(ContentError::IdentifierTaken { id: req.pk.clone() });
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;

        Ok(copies[0].clone())
    }

    async fn tree_nodes(&self, tree_id: &str) -> Result<Vec<ContentNode>, ContentError> {
        let nodes = sqlx::query_as::<_, ContentNode>(&format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes WHERE tree_id = $1"
        ))
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        let root = nodes.iter().find(|n| n.parent_id.is_none()).map(|n| n.id.clone());
        Ok(match root {
            Some(root) => ordered_subtree(&root, nodes),
            None => nodes,
        })
    }

    async fn subtree(&self, node_id: &str) -> Result<Vec<ContentNode>, ContentError> {
        let nodes = sqlx::query_as::<_, ContentNode>(&format!(
            r#"
            WITH RECURSIVE sub AS (
                SELECT * FROM content_nodes WHERE id = $1
                UNION ALL
                SELECT c.* FROM content_nodes c JOIN sub ON c.parent_id = sub.id
            )
            SELECT {NODE_COLUMNS} FROM sub
            "#
        ))
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ordered_subtree(node_id, nodes))
    }

    async fn delete_tree(&self, tree_id: &str) -> Result<u64, ContentError> {
        let res = sqlx::query("DELETE FROM content_nodes WHERE tree_id = $1")
            .bind(tree_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn sync_node(&self, node_id: &str, opts: SyncOptions) -> Result<bool, ContentError> {
        let mut node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| ContentError::node_not_found(node_id))?;
        let Some(source_id) = node.source_node_id.clone() else {
            return Ok(false);
        };
        let Some(source) = self.get_node(&source_id).await? else {
            return Ok(false);
        };

        if !apply_sync(&mut node, &source, opts) {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE content_nodes
            SET title = $2,
                description = $3,
                copyright_holder = $4,
                tags = $5,
                files = $6,
                assessment_items = $7
            WHERE id = $1
            "#,
        )
        .bind(&node.id)
        .bind(&node.title)
        .bind(&node.description)
        .bind(&node.copyright_holder)
        .bind(&node.tags)
        .bind(&node.files)
        .bind(&node.assessment_items)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn get_channel(&self, id: &str) -> Result<Option<Channel>, ContentError> {
        let channel = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn channel_editors(&self, channel_id: &str) -> Result<Vec<User>, ContentError> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.email
            FROM users u
            JOIN channel_members m ON m.user_id = u.id
            WHERE m.channel_id = $1
              AND m.role = 'editor'
            ORDER BY u.email
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn user_channels(&self, user_id: Uuid) -> Result<UserChannels, ContentError> {
        let rows = sqlx::query_as::<_, (String, String, String, String, i32, bool, Option<String>, String)>(
            r#"
            SELECT c.id, c.name, c.root_id, c.tree_id, c.version, c.published, c.secret_token, m.role
            FROM channels c
            JOIN channel_members m ON m.channel_id = c.id
            WHERE m.user_id = $1
            ORDER BY c.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = UserChannels::default();
        for (id, name, root_id, tree_id, version, published, secret_token, role) in rows {
            let channel = Channel {
                id,
                name,
                root_id,
                tree_id,
                version,
                published,
                secret_token,
            };
            if role == "editor" {
                out.editable.push(channel);
            } else {
                out.view_only.push(channel);
            }
        }
        Ok(out)
    }

    async fn mark_tree_published(&self, tree_id: &str) -> Result<u64, ContentError> {
        let res = sqlx::query("UPDATE content_nodes SET published = true WHERE tree_id = $1")
            .bind(tree_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn record_publish(
        &self,
        channel_id: &str,
        version_notes: &str,
    ) -> Result<Channel, ContentError> {
        let channel = sqlx::query_as::<_, Channel>(&format!(
            r#"
            UPDATE channels
            SET version = version + 1,
                published = true,
                secret_token = COALESCE(secret_token, $2),
                last_version_notes = $3,
                last_published_at = now()
            WHERE id = $1
            RETURNING {CHANNEL_COLUMNS}
            "#
        ))
        .bind(channel_id)
        .bind(human_token())
        .bind(version_notes)
        .fetch_optional(&self.pool)
        .await?;

        channel.ok_or_else(|| ContentError::channel_not_found(channel_id))
    }

    async fn put_cached_metadata(&self, key: &str, value: Value) -> Result<(), ContentError> {
        sqlx::query(
            r#"
            INSERT INTO metadata_cache (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cached_metadata(&self, key: &str) -> Result<Option<Value>, ContentError> {
        let value: Option<Value> =
            sqlx::query_scalar("SELECT value FROM metadata_cache WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }
}
