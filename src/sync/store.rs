//! 同步相关的存储操作
//!
//! 本地写入把文档标记为 `synced = 0`；推送成功后按 (doc_id, sequence)
//! 标记回 1，期间被再次修改的文档保持待推送。

use rusqlite::{params, OptionalExtension};

use super::conflict::{resolve, LocalState, Resolution};
use super::protocol::RemoteDocument;
use crate::db::{current_time_ms, ensure_collection, next_sequence, LocalStore};
use crate::error::Result;
use crate::types::{ChangeEvent, ChangeKind, ChangeOrigin, CollectionSpec};

/// 待推送的本地变更
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub doc: RemoteDocument,
    /// 读取时的序号，用于 [`LocalStore::mark_synced`]
    pub sequence: i64,
}

impl LocalStore {
    // ==================== 同步操作 ====================

    /// 按序号读取待推送变更（含删除墓碑）
    pub fn pending_changes(&self, collection: &CollectionSpec, limit: usize) -> Result<Vec<PendingChange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT doc_id, body, revision, deleted, sequence FROM documents
            WHERE scope = ?1 AND collection = ?2 AND synced = 0
            ORDER BY sequence ASC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(
            params![collection.scope, collection.name, limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        let mut changes = Vec::new();
        for row in rows {
            let (id, body, revision, deleted, sequence) = row?;
            let body = if deleted {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&body)?
            };
            changes.push(PendingChange {
                doc: RemoteDocument {
                    id,
                    scope: collection.scope.clone(),
                    collection: collection.name.clone(),
                    revision,
                    deleted,
                    body,
                },
                sequence,
            });
        }

        Ok(changes)
    }

    /// 标记已推送；序号不匹配（推送期间又被修改）的文档保持待推送
    ///
    /// 返回实际标记的数量。
    pub fn mark_synced(&self, pushed: &[(String, i64)]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut marked = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE documents SET synced = 1 WHERE doc_id = ?1 AND sequence = ?2",
            )?;
            for (doc_id, sequence) in pushed {
                marked += stmt.execute(params![doc_id, sequence])?;
            }
        }
        tx.commit()?;
        Ok(marked)
    }

    /// 应用远端文档
    ///
    /// 写入远端副本时发出 origin 为 `Remote` 的变更事件。
    pub fn apply_remote(&self, collection: &CollectionSpec, remote: &RemoteDocument) -> Result<Resolution> {
        let (resolution, event) = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            ensure_collection(&tx, collection)?;

            let local = tx
                .query_row(
                    r#"
                    SELECT revision, deleted, synced, body FROM documents
                    WHERE doc_id = ?1 AND scope = ?2 AND collection = ?3
                    "#,
                    params![remote.id, collection.scope, collection.name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, bool>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?
                .map(|(revision, deleted, synced, body)| LocalState {
                    revision,
                    deleted,
                    synced,
                    body: if deleted {
                        serde_json::Value::Null
                    } else {
                        serde_json::from_str(&body).unwrap_or(serde_json::Value::Null)
                    },
                });

            let resolution = resolve(local.as_ref(), remote);
            let now = current_time_ms();

            let event = match resolution {
                Resolution::Skip => None,
                Resolution::KeepLocal => {
                    // 修订号越过远端，下一次推送时本地副本胜出
                    let sequence = next_sequence(&tx)?;
                    let revision = local.as_ref().map_or(0, |l| l.revision).max(remote.revision) + 1;
                    tx.execute(
                        r#"
                        UPDATE documents SET revision = ?1, sequence = ?2, synced = 0, updated_at = ?3
                        WHERE doc_id = ?4
                        "#,
                        params![revision, sequence, now, remote.id],
                    )?;
                    None
                }
                Resolution::AcceptRemote => {
                    let sequence = next_sequence(&tx)?;
                    let body = if remote.deleted {
                        "{}".to_string()
                    } else {
                        serde_json::to_string(&remote.body)?
                    };

                    let kind = match &local {
                        _ if remote.deleted => ChangeKind::Delete,
                        Some(l) if !l.deleted => ChangeKind::Update,
                        _ => ChangeKind::Insert,
                    };

                    if local.is_some() {
                        tx.execute(
                            r#"
                            UPDATE documents SET body = ?1, revision = ?2, sequence = ?3,
                                deleted = ?4, synced = 1, updated_at = ?5
                            WHERE doc_id = ?6
                            "#,
                            params![body, remote.revision, sequence, remote.deleted, now, remote.id],
                        )?;
                    } else {
                        tx.execute(
                            r#"
                            INSERT INTO documents (doc_id, scope, collection, body, revision, sequence, deleted, synced, updated_at)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
                            "#,
                            params![
                                remote.id,
                                collection.scope,
                                collection.name,
                                body,
                                remote.revision,
                                sequence,
                                remote.deleted,
                                now
                            ],
                        )?;
                    }

                    Some(ChangeEvent {
                        sequence,
                        doc_id: remote.id.clone(),
                        scope: collection.scope.clone(),
                        collection: collection.name.clone(),
                        kind,
                        origin: ChangeOrigin::Remote,
                    })
                }
            };

            tx.commit()?;
            (resolution, event)
        };

        tracing::trace!("⬇️ apply remote doc={} rev={} -> {:?}", remote.id, remote.revision, resolution);
        if let Some(event) = event {
            self.feed.publish(event);
        }
        Ok(resolution)
    }

    /// 读取拉取检查点
    pub fn pull_checkpoint(&self, endpoint: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let since: Option<Option<String>> = conn
            .query_row(
                "SELECT pull_since FROM replication_checkpoints WHERE endpoint = ?1",
                params![endpoint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(since.flatten())
    }

    /// 保存拉取检查点
    pub fn set_pull_checkpoint(&self, endpoint: &str, since: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO replication_checkpoints (endpoint, pull_since, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(endpoint) DO UPDATE SET pull_since = excluded.pull_since, updated_at = excluded.updated_at
            "#,
            params![endpoint, since, current_time_ms()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Document;
    use serde_json::json;

    fn setup() -> (LocalStore, CollectionSpec) {
        let store = LocalStore::open_in_memory().unwrap();
        let c = store.create_collection("inventory", "hotel").unwrap();
        (store, c)
    }

    #[test]
    fn test_pending_then_mark_synced() {
        let (store, c) = setup();
        let mut a = Document::new(json!({"type": "hotel", "name": "A"}));
        let mut b = Document::new(json!({"type": "hotel", "name": "B"}));
        store.save(&c, &mut a).unwrap();
        store.save(&c, &mut b).unwrap();

        let pending = store.pending_changes(&c, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].doc.id, a.id);

        // b 在推送期间又被修改
        let acked: Vec<(String, i64)> = pending.iter().map(|p| (p.doc.id.clone(), p.sequence)).collect();
        b.set_body(json!({"type": "hotel", "name": "B2"}));
        store.save(&c, &mut b).unwrap();

        assert_eq!(store.mark_synced(&acked).unwrap(), 1);
        let pending = store.pending_changes(&c, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].doc.body["name"], "B2");
    }

    #[test]
    fn test_pending_includes_tombstones() {
        let (store, c) = setup();
        let mut a = Document::new(json!({"name": "A"}));
        store.save(&c, &mut a).unwrap();
        store.delete(&c, &a).unwrap();

        let pending = store.pending_changes(&c, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].doc.deleted);
        assert_eq!(pending[0].doc.revision, 2);
    }

    #[test]
    fn test_apply_remote_insert_emits_remote_event() {
        let (store, c) = setup();
        let mut rx = store.changes();

        let remote = RemoteDocument {
            id: "r1".into(),
            scope: "inventory".into(),
            collection: "hotel".into(),
            revision: 1,
            deleted: false,
            body: json!({"type": "hotel", "name": "Remote"}),
        };
        assert_eq!(store.apply_remote(&c, &remote).unwrap(), Resolution::AcceptRemote);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, ChangeOrigin::Remote);
        assert_eq!(event.kind, ChangeKind::Insert);

        // 远端写入不会再被推回
        assert!(store.pending_changes(&c, 10).unwrap().is_empty());
        assert_eq!(store.document(&c, "r1").unwrap().unwrap().body["name"], "Remote");

        // 重复应用是 no-op
        assert_eq!(store.apply_remote(&c, &remote).unwrap(), Resolution::Skip);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_remote_keep_local_bumps_revision() {
        let (store, c) = setup();
        let mut doc = Document::with_id("d1", json!({"name": "local"}));
        store.save(&c, &mut doc).unwrap();

        let remote = RemoteDocument {
            id: "d1".into(),
            scope: "inventory".into(),
            collection: "hotel".into(),
            revision: 1,
            deleted: false,
            body: json!({"name": "remote"}),
        };
        assert_eq!(store.apply_remote(&c, &remote).unwrap(), Resolution::KeepLocal);

        let pending = store.pending_changes(&c, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].doc.revision, 2);
        assert_eq!(pending[0].doc.body["name"], "local");
    }

    #[test]
    fn test_apply_remote_delete() {
        let (store, c) = setup();
        let mut doc = Document::with_id("d1", json!({"name": "A"}));
        store.save(&c, &mut doc).unwrap();
        store.mark_synced(&[("d1".to_string(), doc.sequence)]).unwrap();

        let remote = RemoteDocument {
            id: "d1".into(),
            scope: "inventory".into(),
            collection: "hotel".into(),
            revision: 2,
            deleted: true,
            body: serde_json::Value::Null,
        };
        assert_eq!(store.apply_remote(&c, &remote).unwrap(), Resolution::AcceptRemote);
        assert_eq!(store.count(&c).unwrap(), 0);
    }

    #[test]
    fn test_pull_checkpoint_roundtrip() {
        let (store, _) = setup();
        let endpoint = "https://sync.example.com/travel";
        assert_eq!(store.pull_checkpoint(endpoint).unwrap(), None);

        store.set_pull_checkpoint(endpoint, "10").unwrap();
        store.set_pull_checkpoint(endpoint, "25").unwrap();
        assert_eq!(store.pull_checkpoint(endpoint).unwrap().as_deref(), Some("25"));
    }
}
