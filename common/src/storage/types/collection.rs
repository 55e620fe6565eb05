use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Open,
    Sealed,
}

stored_object!(Collection, "collection", {
    tenant_id: String,
    key: String,
    name: String,
    status: CollectionStatus
});

impl Collection {
    pub fn new(tenant_id: impl Into<String>, key: &str, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            key: normalize_key(key),
            name: name.into(),
            status: CollectionStatus::Open,
        }
    }

    pub async fn find_by_key(
        db: &SurrealDbClient,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE tenant_id = $tenant_id AND key = $key LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("key", normalize_key(key)))
            .await?;
        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Create the collection on first reference, reopening it when sealed.
    pub async fn ensure_open(
        db: &SurrealDbClient,
        tenant_id: &str,
        key: &str,
        name: Option<&str>,
    ) -> Result<Self, AppError> {
        if let Some(existing) = Self::find_by_key(db, tenant_id, key).await? {
            if existing.status == CollectionStatus::Sealed {
                let mut reopened = existing.clone();
                reopened.status = CollectionStatus::Open;
                let updated: Option<Self> = db
                    .update((Self::table_name(), existing.id.as_str()))
                    .content(reopened.clone())
                    .await?;
                return Ok(updated.unwrap_or(reopened));
            }
            return Ok(existing);
        }

        let collection = Self::new(
            tenant_id,
            key,
            name.map(str::to_owned).unwrap_or_else(|| normalize_key(key)),
        );
        let stored = db.store_item(collection.clone()).await?;
        Ok(stored.unwrap_or(collection))
    }

    pub async fn seal(db: &SurrealDbClient, id: &str) -> Result<Option<Self>, AppError> {
        let Some(mut collection) = db.get_item::<Self>(id).await? else {
            return Ok(None);
        };
        collection.status = CollectionStatus::Sealed;
        collection.updated_at = Utc::now();
        let updated: Option<Self> = db
            .update((Self::table_name(), id))
            .content(collection.clone())
            .await?;
        Ok(updated.or(Some(collection)))
    }

    /// A sealed collection rejects new source documents.
    pub fn reject_if_sealed(&self) -> Result<(), AppError> {
        if self.status == CollectionStatus::Sealed {
            return Err(AppError::CollectionSealed(self.key.clone()));
        }
        Ok(())
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("collection_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    #[tokio::test]
    async fn ensure_open_creates_once_per_tenant_key() {
        let db = setup_db().await;

        let first = Collection::ensure_open(&db, "t1", "ISO-Standards", Some("ISO standards"))
            .await
            .expect("create");
        assert_eq!(first.key, "iso-standards");
        assert_eq!(first.status, CollectionStatus::Open);

        let second = Collection::ensure_open(&db, "t1", "iso-standards", None)
            .await
            .expect("reuse");
        assert_eq!(second.id, first.id, "second call must reuse the row");
    }

    #[tokio::test]
    async fn ensure_open_reopens_sealed_collection() {
        let db = setup_db().await;
        let created = Collection::ensure_open(&db, "t1", "manuals", None)
            .await
            .expect("create");

        Collection::seal(&db, &created.id).await.expect("seal");
        let sealed: Collection = db.get_item(&created.id).await.expect("get").expect("row");
        assert_eq!(sealed.status, CollectionStatus::Sealed);
        assert!(sealed.reject_if_sealed().is_err());

        let reopened = Collection::ensure_open(&db, "t1", "manuals", None)
            .await
            .expect("reopen");
        assert_eq!(reopened.id, created.id);
        assert_eq!(reopened.status, CollectionStatus::Open);
    }

    #[tokio::test]
    async fn same_key_is_independent_per_tenant() {
        let db = setup_db().await;
        let a = Collection::ensure_open(&db, "t1", "manuals", None)
            .await
            .expect("t1 create");
        let b = Collection::ensure_open(&db, "t2", "manuals", None)
            .await
            .expect("t2 create");
        assert_ne!(a.id, b.id);
    }
}
