//! User CRUD on the relational store, with index updates pushed to the queue.
//!
//! Each write lands in Postgres first and is then announced as a single
//! [`IndexingInstruction`] on the primary queue. A failed announcement is
//! logged only: the row stays unsynced and the change poller picks it up.
//!
//! Reads go to the index: [`UserService::search_users`] runs a full-text
//! query over live documents with optional field filters, highlighting and
//! page-based pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SearchSyncConfig;
use crate::message::{IndexAction, IndexingInstruction, QueueEnvelope, USERS_COLLECTION};
use crate::search::Filter;
use crate::storage::traits::{
    DocumentQuery, MatchingStrategy, MessageBroker, SearchIndexSink, SearchQuery, StorageError, UserRepository,
};
use crate::user::{NewUser, UserDocument, UserPatch, UserRecord};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("user '{0}' not found")]
    NotFound(String),
    #[error("update carries no fields")]
    EmptyPatch,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fields returned for each search hit.
const SEARCH_FIELDS: &[&str] = &[
    "id",
    "name",
    "email",
    "phone",
    "date_of_birth",
    "age",
    "address",
    "city",
    "state",
    "direction",
    "country",
    "postal_code",
    "created_at",
];

const DEFAULT_PAGE_SIZE: usize = 20;

/// Parameters of a user search. Empty strings count as unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSearch {
    pub q: String,
    pub age: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub direction: Option<String>,
    pub country: Option<String>,
    /// Creation window, exclusive on both ends; applied only when both are set
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Field to sort by; defaults to `created_at`
    pub sort_by: Option<String>,
    pub descending: bool,
    /// `last`, `all` or `frequency`
    pub matching_strategy: Option<String>,
    /// 1-based
    pub page: usize,
    pub limit: usize,
}

impl UserSearch {
    fn filter(&self) -> Filter {
        let mut filter = Filter::is_null("deleted_at");
        for (field, value) in [
            ("age", &self.age),
            ("city", &self.city),
            ("state", &self.state),
            ("direction", &self.direction),
            ("country", &self.country),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                filter = filter.and(Filter::eq(field, value));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            filter = filter
                .and(Filter::gt("created_at", start.timestamp()))
                .and(Filter::lt("created_at", end.timestamp()));
        }
        filter
    }

    fn to_query(&self) -> SearchQuery {
        let sort_by = self.sort_by.as_deref().filter(|s| !s.is_empty()).unwrap_or("created_at");
        let direction = if self.descending { "desc" } else { "asc" };
        let strategy = self
            .matching_strategy
            .as_deref()
            .and_then(MatchingStrategy::parse)
            .unwrap_or_default();
        let limit = if self.limit == 0 { DEFAULT_PAGE_SIZE } else { self.limit };

        let mut query = SearchQuery::new(self.q.trim())
            .filter(self.filter())
            .sort([format!("{}:{}", sort_by, direction)])
            .retrieve(SEARCH_FIELDS.iter().copied())
            .matching_strategy(strategy)
            .page(self.page, limit);
        if !query.q.is_empty() {
            query = query.highlight(["*"]).show_matches_position(true);
        }
        query
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPage {
    pub users: Vec<UserDocument>,
    pub query: String,
    pub page: usize,
    pub limit: usize,
    pub total: u64,
    pub total_pages: u64,
}

pub struct UserService {
    users: Arc<dyn UserRepository>,
    index: Arc<dyn SearchIndexSink>,
    broker: Arc<dyn MessageBroker>,
    secret: String,
    message_ttl_secs: i64,
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        index: Arc<dyn SearchIndexSink>,
        broker: Arc<dyn MessageBroker>,
        config: &SearchSyncConfig,
    ) -> Self {
        Self {
            users,
            index,
            broker,
            secret: config.rabbitmq_secret.clone(),
            message_ttl_secs: config.message_ttl_secs,
        }
    }

    #[tracing::instrument(skip(self, user), fields(email = %user.email))]
    pub async fn create_user(&self, user: &NewUser) -> Result<UserRecord, ServiceError> {
        let record = self.users.insert_user(user).await?;
        let document = document_value(&record)?;
        self.announce(IndexingInstruction::single(IndexAction::Insert, &record.id, document))
            .await;
        Ok(record)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserRecord, ServiceError> {
        if patch.is_empty() {
            return Err(ServiceError::EmptyPatch);
        }
        let record = self.users.update_user(id, patch).await.map_err(|e| not_found(id, e))?;
        let document = document_value(&record)?;
        self.announce(IndexingInstruction::single(IndexAction::Update, &record.id, document))
            .await;
        Ok(record)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_user(&self, id: &str) -> Result<UserRecord, ServiceError> {
        let record = self.users.soft_delete_user(id).await.map_err(|e| not_found(id, e))?;
        self.announce(IndexingInstruction::single(IndexAction::Delete, &record.id, json!({ "id": record.id })))
            .await;
        Ok(record)
    }

    /// One live document from the index.
    pub async fn get_user(&self, id: &str) -> Result<Option<UserDocument>, ServiceError> {
        let Some(raw) = self.index.get_document(USERS_COLLECTION, id).await? else {
            return Ok(None);
        };
        let document = decode(raw)?;
        Ok(document.deleted_at.is_none().then_some(document))
    }

    /// A page of live documents from the index.
    pub async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserDocument>, ServiceError> {
        let query = DocumentQuery::filtered(Filter::is_null("deleted_at"))
            .limit(limit)
            .offset(offset);
        let hits = match self.index.find_documents(USERS_COLLECTION, &query).await {
            Ok(hits) => hits,
            Err(StorageError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(hits.into_iter().map(decode).collect::<Result<Vec<_>, _>>()?)
    }

    /// Full-text search over live documents.
    #[tracing::instrument(skip(self, search), fields(q = %search.q))]
    pub async fn search_users(&self, search: &UserSearch) -> Result<UserPage, ServiceError> {
        let query = search.to_query();
        let results = match self.index.search(USERS_COLLECTION, &query).await {
            Ok(results) => results,
            Err(StorageError::NotFound) => {
                return Ok(UserPage {
                    users: Vec::new(),
                    query: query.q,
                    page: query.page,
                    limit: query.hits_per_page,
                    total: 0,
                    total_pages: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let users = results.hits.into_iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        debug!(hits = users.len(), total = results.total_hits, "User search served");
        Ok(UserPage {
            users,
            query: results.query,
            page: results.page,
            limit: results.hits_per_page,
            total: results.total_hits,
            total_pages: results.total_pages,
        })
    }

    async fn announce(&self, instruction: IndexingInstruction) {
        let action = instruction.action.clone();
        let envelope = match QueueEnvelope::primary(&instruction) {
            Ok(envelope) => envelope.signed(&self.secret, self.message_ttl_secs),
            Err(e) => {
                warn!(%action, error = %e, "Could not encode indexing instruction");
                return;
            }
        };
        match self.broker.publish(&envelope).await {
            Ok(()) => debug!(%action, "Indexing instruction published"),
            Err(e) => warn!(%action, error = %e, "Indexing publish failed, leaving it to the poller"),
        }
    }
}

fn document_value(record: &UserRecord) -> Result<Value, StorageError> {
    record
        .to_document()
        .to_value()
        .map_err(|e| StorageError::Decode(e.to_string()))
}

fn decode(raw: Value) -> Result<UserDocument, StorageError> {
    serde_json::from_value(raw).map_err(|e| StorageError::Decode(format!("user document: {}", e)))
}

fn not_found(id: &str, e: StorageError) -> ServiceError {
    match e {
        StorageError::NotFound | StorageError::NoRowsAffected => ServiceError::NotFound(id.to_string()),
        other => ServiceError::Storage(other),
    }
}
