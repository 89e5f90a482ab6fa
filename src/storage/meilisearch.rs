//! Meilisearch backend over its REST API.
//!
//! Writes are asynchronous on the Meilisearch side: every mutation returns a
//! [`TaskHandle`] and [`SearchIndexSink::wait_for_task`] polls `/tasks/{uid}`
//! until the task settles.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{
    AttributeKind, DocumentQuery, IndexStats, SearchIndexSink, SearchQuery, SearchResults, StorageError, TaskHandle,
};
use crate::resilience::retry::{retry, retry_when, RetryConfig};
use crate::search::MeiliTranslator;

const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSummary {
    task_uid: u64,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    number_of_documents: u64,
    #[serde(default)]
    is_indexing: bool,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    hits: Vec<Value>,
    #[serde(default)]
    query: String,
    #[serde(default)]
    page: usize,
    #[serde(default)]
    hits_per_page: usize,
    #[serde(default)]
    total_hits: u64,
    #[serde(default)]
    total_pages: u64,
}

/// Request body for `POST /indexes/{uid}/search`, in page mode.
fn search_body(query: &SearchQuery) -> Value {
    let mut body = json!({
        "q": query.q,
        "page": query.page,
        "hitsPerPage": query.hits_per_page,
        "matchingStrategy": query.matching_strategy.as_str(),
        "showMatchesPosition": query.show_matches_position,
    });
    if let Some(filter) = &query.filter {
        body["filter"] = Value::String(MeiliTranslator::translate(filter));
    }
    if !query.sort.is_empty() {
        body["sort"] = json!(query.sort);
    }
    if !query.attributes_to_retrieve.is_empty() {
        body["attributesToRetrieve"] = json!(query.attributes_to_retrieve);
    }
    if !query.attributes_to_highlight.is_empty() {
        body["attributesToHighlight"] = json!(query.attributes_to_highlight);
    }
    body
}

fn transport(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else if e.is_decode() {
        StorageError::Decode(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

pub struct MeiliIndex {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl MeiliIndex {
    /// Build the client and check `/health` with startup-mode retry.
    pub async fn connect(url: &str, api_key: Option<String>) -> Result<Self, StorageError> {
        let base = Url::parse(url).map_err(|e| StorageError::Backend(format!("invalid meilisearch url '{}': {}", url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(transport)?;

        let index = Self { client, base, api_key };
        retry("meilisearch_connect", &RetryConfig::startup(), || index.health())
            .await
            .map_err(|e| {
                crate::metrics::record_connection_error("meilisearch");
                e
            })?;
        Ok(index)
    }

    pub async fn health(&self) -> Result<(), StorageError> {
        let url = self.endpoint(&["health"])?;
        let _: Option<Value> = self.send(self.request(Method::GET, url)).await?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::Backend(format!("meilisearch url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send and decode. 404 maps to `Ok(None)`.
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>, StorageError> {
        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Backend(format!("meilisearch returned {}: {}", status, body)));
        }
        response.json().await.map(Some).map_err(transport)
    }

    async fn send_task(&self, builder: RequestBuilder) -> Result<TaskHandle, StorageError> {
        let summary: TaskSummary = self.send(builder).await?.ok_or(StorageError::NotFound)?;
        Ok(TaskHandle { uid: summary.task_uid })
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &str, url: Url) -> Result<Option<T>, StorageError> {
        retry_when(op, &RetryConfig::query(), StorageError::is_transient, || {
            self.send(self.request(Method::GET, url.clone()))
        })
        .await
    }
}

#[async_trait]
impl SearchIndexSink for MeiliIndex {
    async fn ensure_index(&self, index: &str, primary_key: &str) -> Result<(), StorageError> {
        let existing: Option<Value> = self.get_json("meilisearch_get_index", self.endpoint(&["indexes", index])?).await?;
        if existing.is_some() {
            return Ok(());
        }

        let task = self
            .send_task(
                self.request(Method::POST, self.endpoint(&["indexes"])?)
                    .json(&json!({ "uid": index, "primaryKey": primary_key })),
            )
            .await?;
        match self.wait_for_task(task, Duration::from_secs(10)).await {
            // Another process created it first
            Err(StorageError::Backend(msg)) if msg.contains("index_already_exists") => Ok(()),
            other => other,
        }
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StorageError> {
        self.get_json("meilisearch_get_document", self.endpoint(&["indexes", index, "documents", id])?)
            .await
    }

    async fn find_documents(&self, index: &str, query: &DocumentQuery) -> Result<Vec<Value>, StorageError> {
        let mut body = json!({ "limit": query.limit, "offset": query.offset });
        if let Some(filter) = &query.filter {
            body["filter"] = Value::String(MeiliTranslator::translate(filter));
        }
        if !query.fields.is_empty() {
            body["fields"] = json!(query.fields);
        }
        let url = self.endpoint(&["indexes", index, "documents", "fetch"])?;

        let response: Option<FetchResponse> =
            retry_when("meilisearch_fetch_documents", &RetryConfig::query(), StorageError::is_transient, || {
                self.send(self.request(Method::POST, url.clone()).json(&body))
            })
            .await?;
        response.map(|r| r.results).ok_or(StorageError::NotFound)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults, StorageError> {
        let body = search_body(query);
        let url = self.endpoint(&["indexes", index, "search"])?;

        let response: SearchResponse =
            retry_when("meilisearch_search", &RetryConfig::query(), StorageError::is_transient, || {
                self.send(self.request(Method::POST, url.clone()).json(&body))
            })
            .await?
            .ok_or(StorageError::NotFound)?;
        Ok(SearchResults {
            hits: response.hits,
            query: response.query,
            page: response.page,
            hits_per_page: response.hits_per_page,
            total_hits: response.total_hits,
            total_pages: response.total_pages,
        })
    }

    async fn add_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError> {
        let url = self.endpoint(&["indexes", index, "documents"])?;
        self.send_task(self.request(Method::POST, url).json(documents)).await
    }

    async fn update_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError> {
        let url = self.endpoint(&["indexes", index, "documents"])?;
        self.send_task(self.request(Method::PUT, url).json(documents)).await
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<TaskHandle, StorageError> {
        let url = self.endpoint(&["indexes", index, "documents", id])?;
        self.send_task(self.request(Method::DELETE, url)).await
    }

    async fn stats(&self, index: &str) -> Result<IndexStats, StorageError> {
        let body: StatsBody = self
            .get_json("meilisearch_stats", self.endpoint(&["indexes", index, "stats"])?)
            .await?
            .ok_or(StorageError::NotFound)?;
        Ok(IndexStats {
            number_of_documents: body.number_of_documents,
            is_indexing: body.is_indexing,
        })
    }

    async fn get_attributes(&self, index: &str, kind: AttributeKind) -> Result<Vec<String>, StorageError> {
        let url = self.endpoint(&["indexes", index, "settings", kind.settings_path()])?;
        let attributes: Option<Vec<String>> = self.get_json("meilisearch_get_attributes", url).await?;
        attributes.ok_or(StorageError::NotFound)
    }

    async fn update_attributes(
        &self,
        index: &str,
        kind: AttributeKind,
        attributes: &[String],
    ) -> Result<TaskHandle, StorageError> {
        let url = self.endpoint(&["indexes", index, "settings", kind.settings_path()])?;
        self.send_task(self.request(Method::PUT, url).json(attributes)).await
    }

    async fn wait_for_task(&self, task: TaskHandle, timeout: Duration) -> Result<(), StorageError> {
        let url = self.endpoint(&["tasks", &task.uid.to_string()])?;
        let deadline = Instant::now() + timeout;

        loop {
            let status: TaskStatus = self
                .send(self.request(Method::GET, url.clone()))
                .await?
                .ok_or(StorageError::NotFound)?;

            match status.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    let (message, code) = status
                        .error
                        .map(|e| (e.message, e.code))
                        .unwrap_or_else(|| (status.status.clone(), String::new()));
                    return Err(StorageError::Backend(format!(
                        "task {} {}: {} ({})",
                        task.uid, status.status, message, code
                    )));
                }
                pending => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::Timeout(format!("task {} ({})", task.uid, pending)));
                    }
                    debug!(task = task.uid, status = pending, "Waiting for index task");
                    tokio::time::sleep(TASK_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(base: &str) -> MeiliIndex {
        MeiliIndex {
            client: Client::new(),
            base: Url::parse(base).unwrap(),
            api_key: None,
        }
    }

    #[test]
    fn test_endpoint_escapes_ids() {
        let meili = index("http://127.0.0.1:7700");
        let url = meili.endpoint(&["indexes", "users", "documents", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:7700/indexes/users/documents/a%2Fb%20c");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let meili = index("http://search.internal/meili/");
        let url = meili.endpoint(&["tasks", "42"]).unwrap();
        assert_eq!(url.as_str(), "http://search.internal/meili/tasks/42");
    }

    #[test]
    fn test_search_body() {
        use crate::search::Filter;
        use crate::storage::traits::MatchingStrategy;

        let query = SearchQuery::new("ada")
            .filter(Filter::is_null("deleted_at").and(Filter::eq("city", "London")))
            .sort(["created_at:desc"])
            .retrieve(["id", "name"])
            .highlight(["name", "email"])
            .show_matches_position(true)
            .matching_strategy(MatchingStrategy::All)
            .page(2, 10);

        assert_eq!(
            search_body(&query),
            json!({
                "q": "ada",
                "page": 2,
                "hitsPerPage": 10,
                "matchingStrategy": "all",
                "showMatchesPosition": true,
                "filter": "(deleted_at IS NULL AND city = \"London\")",
                "sort": ["created_at:desc"],
                "attributesToRetrieve": ["id", "name"],
                "attributesToHighlight": ["name", "email"],
            })
        );
        assert!(search_body(&SearchQuery::new("")).get("filter").is_none());
    }

    #[test]
    fn test_search_response_decodes() {
        let response: SearchResponse = serde_json::from_str(
            r#"{"hits":[{"id":"a","_formatted":{"name":"<em>Ada</em>"}}],"query":"ada","processingTimeMs":1,
                "hitsPerPage":20,"page":1,"totalPages":1,"totalHits":1}"#,
        )
        .unwrap();
        assert_eq!((response.total_hits, response.total_pages, response.page), (1, 1, 1));
        assert_eq!(response.hits[0]["_formatted"]["name"], "<em>Ada</em>");
    }

    #[test]
    fn test_task_payloads_decode() {
        let summary: TaskSummary =
            serde_json::from_str(r#"{"taskUid":7,"indexUid":"users","status":"enqueued","type":"documentAdditionOrUpdate"}"#)
                .unwrap();
        assert_eq!(summary.task_uid, 7);

        let failed: TaskStatus = serde_json::from_str(
            r#"{"uid":7,"status":"failed","error":{"message":"missing primary key","code":"missing_document_id"}}"#,
        )
        .unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error.unwrap().code, "missing_document_id");

        let stats: StatsBody =
            serde_json::from_str(r#"{"numberOfDocuments":3,"isIndexing":false,"fieldDistribution":{}}"#).unwrap();
        assert_eq!(stats.number_of_documents, 3);
    }
}
