//! Conversation-key rotation and its audit log.
//!
//! Rotating replaces the live key with the one derived at `version + 1` and
//! appends a [`RotationRecord`]. The previous key is not retained.

use chrono::Utc;
use ck_proto::RotationRecord;
use tracing::info;

use crate::{
    conversation_keys::{current_version, upsert_conversation_key, wrap_for_row},
    db::Store,
    error::StoreError,
    models::RotationRow,
    session::Session,
};

impl Store {
    /// Derive and store the next version of `conversation_id` from
    /// `new_shared_secret`. A conversation with no key starts at version 1.
    ///
    /// The version read and both writes share one transaction. Concurrent
    /// rotations of the same conversation must still be serialised by the
    /// caller; the loser fails on the history uniqueness constraint.
    pub async fn rotate_conversation_key(
        &self,
        session: &Session,
        conversation_id: &str,
        new_shared_secret: &[u8],
        reason: &str,
    ) -> Result<RotationRecord, StoreError> {
        if !session.is_set().await {
            return Err(StoreError::MasterKeyNotSet);
        }

        let mut tx = self.pool().begin().await?;
        let old_version = current_version(&mut tx, conversation_id).await?.unwrap_or(0);
        let new_version = old_version
            .checked_add(1)
            .ok_or_else(|| StoreError::InvalidInput("key version overflow".into()))?;

        let key = self.derive_conversation_key(new_shared_secret, conversation_id, new_version)?;
        let sealed = wrap_for_row(session, conversation_id, &key, new_version).await?;

        let now = Utc::now();
        upsert_conversation_key(&mut tx, conversation_id, &sealed, new_version, now, Some(now)).await?;
        sqlx::query(
            "INSERT INTO rotation_history (conversation_id, old_version, new_version, rotated_at, reason)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(i64::from(old_version))
        .bind(i64::from(new_version))
        .bind(now)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(conversation_id, old_version, new_version, reason, "conversation key rotated");
        Ok(RotationRecord {
            conversation_id: conversation_id.to_owned(),
            old_version,
            new_version,
            rotated_at: now,
            reason: reason.to_owned(),
        })
    }

    /// Rotation records for `conversation_id`, oldest first.
    pub async fn get_rotation_history(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RotationRecord>, StoreError> {
        let rows: Vec<RotationRow> = sqlx::query_as(
            "SELECT conversation_id, old_version, new_version, rotated_at, reason
             FROM rotation_history WHERE conversation_id = ? ORDER BY seq",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(RotationRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StoreConfig, lookup::Lookup};

    async fn unlocked() -> (Store, Session) {
        let store = Store::in_memory(StoreConfig::insecure_fast()).await.unwrap();
        let session = store.new_session().await;
        session.set_master_key(&[0x42; 32]).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn rotating_without_prior_key_starts_at_one() {
        let (store, session) = unlocked().await;
        let record = store
            .rotate_conversation_key(&session, "conv-new", &[7u8; 32], "manual")
            .await
            .unwrap();
        assert_eq!((record.old_version, record.new_version), (0, 1));

        let expected = store.derive_conversation_key(&[7u8; 32], "conv-new", 1).unwrap();
        let live = store.get_conversation_key(&session, "conv-new").await.into_result().unwrap();
        assert_eq!(live, Some(expected));
    }

    #[tokio::test]
    async fn rotation_bumps_version_and_stamps_time() {
        let (store, session) = unlocked().await;
        let v1 = store.derive_conversation_key(&[1u8; 32], "conv-1", 1).unwrap();
        store.store_conversation_key(&session, "conv-1", &v1, 1).await.unwrap();

        store.rotate_conversation_key(&session, "conv-1", &[2u8; 32], "member_added").await.unwrap();
        store.rotate_conversation_key(&session, "conv-1", &[3u8; 32], "member_removed").await.unwrap();

        let info = store.get_conversation_key_info("conv-1").await.unwrap().unwrap();
        assert_eq!(info.version, 3);
        assert!(info.rotated_at.is_some());

        let history = store.get_rotation_history("conv-1").await.unwrap();
        let summary: Vec<_> = history
            .iter()
            .map(|r| (r.old_version, r.new_version, r.reason.as_str()))
            .collect();
        assert_eq!(summary, [(1, 2, "member_added"), (2, 3, "member_removed")]);
    }

    #[tokio::test]
    async fn reason_is_stored_verbatim() {
        let (store, session) = unlocked().await;
        let odd = "ünïcode; DROP TABLE rotation_history; --";
        store.rotate_conversation_key(&session, "c", &[9u8; 32], odd).await.unwrap();
        assert_eq!(store.get_rotation_history("c").await.unwrap()[0].reason, odd);
    }

    #[tokio::test]
    async fn rotation_requires_master_key_and_valid_secret() {
        let (store, _) = unlocked().await;
        let empty = store.new_session().await;
        assert!(matches!(
            store.rotate_conversation_key(&empty, "c", &[1u8; 32], "manual").await,
            Err(StoreError::MasterKeyNotSet)
        ));

        let (store, session) = unlocked().await;
        assert!(matches!(
            store.rotate_conversation_key(&session, "c", &[1u8; 16], "manual").await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(store.get_conversation_key(&session, "c").await, Lookup::NotFound));
        assert!(store.get_rotation_history("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_per_conversation() {
        let (store, session) = unlocked().await;
        store.rotate_conversation_key(&session, "a", &[1u8; 32], "manual").await.unwrap();
        store.rotate_conversation_key(&session, "b", &[1u8; 32], "manual").await.unwrap();
        store.rotate_conversation_key(&session, "a", &[2u8; 32], "manual").await.unwrap();
        assert_eq!(store.get_rotation_history("a").await.unwrap().len(), 2);
        assert_eq!(store.get_rotation_history("b").await.unwrap().len(), 1);
        assert!(store.get_rotation_history("c").await.unwrap().is_empty());
    }
}
