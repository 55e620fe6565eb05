use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(VisualCacheEntry, "visual_cache", {
    cache_key: String,
    content_type: String,
    provider: String,
    model: String,
    prompt_version: String,
    schema_version: String,
    summary: String
});

impl VisualCacheEntry {
    /// Cache key over everything that can change the produced summary.
    pub fn cache_key(
        image_hash: &str,
        content_type: &str,
        provider: &str,
        model: &str,
        prompt_version: &str,
        schema_version: &str,
    ) -> String {
        format!("{image_hash}:{content_type}:{provider}:{model}:{prompt_version}:{schema_version}")
    }

    pub async fn lookup(
        db: &SurrealDbClient,
        cache_key: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE cache_key = $cache_key LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("cache_key", cache_key.to_owned()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        db: &SurrealDbClient,
        cache_key: &str,
        content_type: &str,
        provider: &str,
        model: &str,
        prompt_version: &str,
        schema_version: &str,
        summary: &str,
    ) -> Result<Self, AppError> {
        let now = Utc::now();
        let entry = Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            cache_key: cache_key.to_owned(),
            content_type: content_type.to_owned(),
            provider: provider.to_owned(),
            model: model.to_owned(),
            prompt_version: prompt_version.to_owned(),
            schema_version: schema_version.to_owned(),
            summary: summary.to_owned(),
        };
        let stored = db.store_item(entry.clone()).await?;
        Ok(stored.unwrap_or(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn store_and_lookup_round_trip() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("visual_ns", &database)
            .await
            .expect("in-memory db");

        let key = VisualCacheEntry::cache_key("abc123", "image/png", "openai", "gpt-4o-mini", "v2", "1");
        assert!(VisualCacheEntry::lookup(&db, &key).await.expect("lookup").is_none());

        VisualCacheEntry::store(
            &db,
            &key,
            "image/png",
            "openai",
            "gpt-4o-mini",
            "v2",
            "1",
            "Bar chart of defect rates by quarter",
        )
        .await
        .expect("store");

        let hit = VisualCacheEntry::lookup(&db, &key)
            .await
            .expect("lookup")
            .expect("cache hit");
        assert_eq!(hit.summary, "Bar chart of defect rates by quarter");
    }
}
