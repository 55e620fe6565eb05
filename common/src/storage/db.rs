use crate::error::AppError;

use super::types::StoredObject;
use futures::Stream;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define schema-level constraints and plain lookup indexes.
    ///
    /// Runtime HNSW/FTS indexes depend on the embedding dimension and are
    /// built separately through `indexes::ensure_runtime_indexes`.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_collection_tenant_key ON TABLE collection FIELDS tenant_id, key UNIQUE;
                 DEFINE INDEX IF NOT EXISTS idx_entity_tenant_name ON TABLE knowledge_entity FIELDS tenant_id, name_key UNIQUE;
                 DEFINE INDEX IF NOT EXISTS idx_job_status ON TABLE job_queue FIELDS status;
                 DEFINE INDEX IF NOT EXISTS idx_job_type ON TABLE job_queue FIELDS job_type;
                 DEFINE INDEX IF NOT EXISTS idx_job_created ON TABLE job_queue FIELDS created_at;
                 DEFINE INDEX IF NOT EXISTS idx_document_tenant ON TABLE source_document FIELDS tenant_id;
                 DEFINE INDEX IF NOT EXISTS idx_document_status ON TABLE source_document FIELDS status;
                 DEFINE INDEX IF NOT EXISTS idx_event_document ON TABLE ingestion_event FIELDS source_document_id;
                 DEFINE INDEX IF NOT EXISTS idx_chunk_source ON TABLE content_chunk FIELDS source_id;
                 DEFINE INDEX IF NOT EXISTS idx_provenance_entity ON TABLE node_provenance FIELDS entity_id;",
            )
            .await?
            .check()?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string(); // ensures isolation per test run
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_unique_entity_name_constraint() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init");

        db.client
            .query("CREATE knowledge_entity SET tenant_id = 't1', name_key = 'iso 9001'")
            .await
            .expect("first insert")
            .check()
            .expect("first insert should pass");

        let duplicate = db
            .client
            .query("CREATE knowledge_entity SET tenant_id = 't1', name_key = 'iso 9001'")
            .await
            .expect("query submitted")
            .check();
        assert!(duplicate.is_err(), "duplicate (tenant, name) must be rejected");

        // Same name under another tenant is fine.
        db.client
            .query("CREATE knowledge_entity SET tenant_id = 't2', name_key = 'iso 9001'")
            .await
            .expect("other tenant insert")
            .check()
            .expect("other tenant insert should pass");
    }
}
