//! REST adapter: the remote store over JSON and a pluggable HTTP client.

use crate::config::AdapterConfig;
use crate::error::{FlushError, FlushResult};
use crate::remote::{QueryParams, RemoteStore};
use crate::serializer::JsonSerializer;
use async_trait::async_trait;
use parking_lot::RwLock;
use relsync_model::{Entity, EntityKey, EntityType, IdentityMap, ModelError, Schema, Session};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// An HTTP request with a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute or host-relative URL.
    pub url: String,
    /// Query parameters.
    pub query: QueryParams,
    /// JSON body.
    pub body: Option<Value>,
}

/// An HTTP response with a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body (`Null` for an empty body).
    pub body: Value,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// This trait allows the adapter to work with any HTTP client
/// implementation (reqwest, hyper, or a test stub). A returned `Err` is a
/// failure to get any response at all.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Remote store speaking JSON over HTTP.
pub struct RestAdapter<C: HttpClient> {
    config: AdapterConfig,
    client: C,
    serializer: JsonSerializer,
    identity_map: Arc<IdentityMap>,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> RestAdapter<C> {
    /// Creates an adapter. Fails if the configuration is invalid.
    pub fn new(
        config: AdapterConfig,
        client: C,
        schema: Arc<Schema>,
        identity_map: Arc<IdentityMap>,
    ) -> FlushResult<Self> {
        config.validate()?;
        let serializer = JsonSerializer::new(schema).with_plurals(config.plurals.clone());
        Ok(Self {
            config,
            client,
            serializer,
            identity_map,
            last_error: RwLock::new(None),
        })
    }

    /// Creates an adapter sharing the session's schema and identity map.
    pub fn for_session(config: AdapterConfig, client: C, session: &Session) -> FlushResult<Self> {
        Self::new(
            config,
            client,
            Arc::clone(session.schema()),
            Arc::clone(session.identity_map()),
        )
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the serializer.
    pub fn serializer(&self) -> &JsonSerializer {
        &self.serializer
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Builds the URL for a root, optionally followed by a suffix
    /// (usually a record id).
    pub fn build_url(&self, root: &str, suffix: Option<&str>) -> FlushResult<String> {
        if root.starts_with('/') {
            return Err(FlushError::Config(format!("root ({root}) must not start with slash")));
        }
        let mut parts = vec![self.config.url.trim_end_matches('/').to_string()];
        if let Some(namespace) = &self.config.namespace {
            parts.push(namespace.clone());
        }
        parts.push(self.serializer.pluralize(root));
        if let Some(suffix) = suffix {
            if suffix.starts_with('/') {
                return Err(FlushError::Config(format!(
                    "suffix ({suffix}) must not start with slash"
                )));
            }
            parts.push(suffix.to_string());
        }
        Ok(parts.join("/"))
    }

    /// Builds the query for an incremental fetch.
    pub fn since_query(&self, since: Option<&str>) -> QueryParams {
        since
            .map(|since| QueryParams::from([(self.config.since_param.clone(), since.to_string())]))
            .unwrap_or_default()
    }

    /// Returns a record, from the identity map if it has already been loaded.
    pub async fn load(&self, entity_type: &EntityType, id: &str) -> FlushResult<Entity> {
        if let Some(cached) = self.identity_map.get(entity_type, id) {
            trace!(%entity_type, id, "load served from identity map");
            return Ok(cached);
        }
        self.find(entity_type, id).await
    }

    /// Re-fetches a persisted entity.
    pub async fn refresh(&self, entity: &Entity) -> FlushResult<Entity> {
        let id = require_id(entity)?;
        self.find(entity.entity_type(), &id).await
    }

    fn url_for(&self, entity_type: &EntityType, suffix: Option<&str>) -> FlushResult<String> {
        self.build_url(&self.serializer.root_for_type(entity_type), suffix)
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        query: QueryParams,
        body: Option<Value>,
        subject: Option<&EntityKey>,
    ) -> FlushResult<Value> {
        debug!(method = method.as_str(), %url, "sending request");
        let request = HttpRequest {
            method,
            url,
            query,
            body,
        };

        let response = tokio::time::timeout(self.config.timeout, self.client.send(request))
            .await
            .map_err(|_| FlushError::Timeout)?
            .map_err(|e| {
                *self.last_error.write() = Some(e.clone());
                FlushError::transport_retryable(e)
            })?;

        *self.last_error.write() = None;

        if response.is_success() {
            return Ok(response.body);
        }

        if let (Some(entity), Some(errors)) =
            (subject, JsonSerializer::extract_validation_errors(&response.body))
        {
            return Err(FlushError::Validation {
                entity: entity.clone(),
                errors,
            });
        }

        let message = match &response.body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Err(FlushError::Remote {
            status: response.status,
            message,
        })
    }

    /// Decodes a payload and merges every record into the identity map.
    fn did_receive_data(&self, payload: &Value) -> FlushResult<Vec<Entity>> {
        if payload.is_null() {
            return Ok(Vec::new());
        }
        let records = self.serializer.deserialize(payload, &self.identity_map)?;
        for record in &records {
            self.identity_map.upsert(record)?;
        }
        Ok(records)
    }

    /// Merges a write response and returns the record for `entity`.
    ///
    /// An empty response confirms the entity as sent.
    fn did_receive_record(&self, entity: &Entity, payload: &Value) -> FlushResult<Entity> {
        let records = self.did_receive_data(payload)?;
        if let Some(record) = records.into_iter().find(|r| r.is_same(entity)) {
            return Ok(record);
        }

        let mut confirmed = entity.clone();
        confirmed.mark_persisted();
        self.identity_map.upsert(&confirmed)?;
        Ok(confirmed)
    }
}

fn require_id(entity: &Entity) -> FlushResult<String> {
    entity.id().map(str::to_string).ok_or_else(|| {
        ModelError::MissingServerId {
            entity_type: entity.entity_type().clone(),
            client_id: entity.client_id(),
        }
        .into()
    })
}

#[async_trait]
impl<C: HttpClient> RemoteStore for RestAdapter<C> {
    async fn create(&self, entity: &Entity) -> FlushResult<Entity> {
        let body = self
            .serializer
            .serialize_root(entity, true, &self.identity_map)?;
        let url = self.url_for(entity.entity_type(), None)?;
        let payload = self
            .send(Method::Post, url, QueryParams::new(), Some(body), Some(entity.key()))
            .await?;

        let id = self
            .serializer
            .primary_id(&payload, entity.entity_type())
            .ok_or_else(|| {
                FlushError::Codec(format!("create response for {} carries no record", entity.key()))
            })?;
        self.identity_map
            .bind(entity.entity_type(), &id, entity.client_id());
        self.did_receive_record(entity, &payload)
    }

    async fn update(&self, entity: &Entity) -> FlushResult<Entity> {
        let id = require_id(entity)?;
        // The id travels in the URL.
        let body = self
            .serializer
            .serialize_root(entity, false, &self.identity_map)?;
        let url = self.url_for(entity.entity_type(), Some(&id))?;
        let payload = self
            .send(Method::Put, url, QueryParams::new(), Some(body), Some(entity.key()))
            .await?;
        self.did_receive_record(entity, &payload)
    }

    async fn delete(&self, entity: &Entity) -> FlushResult<Entity> {
        let id = require_id(entity)?;
        let url = self.url_for(entity.entity_type(), Some(&id))?;
        let payload = self
            .send(Method::Delete, url, QueryParams::new(), None, Some(entity.key()))
            .await?;

        // Sideloaded records may still ride along.
        self.did_receive_data(&payload)?;
        self.identity_map.evict(entity.client_id());
        let mut deleted = entity.clone();
        deleted.mark_deleted();
        Ok(deleted)
    }

    async fn find(&self, entity_type: &EntityType, id: &str) -> FlushResult<Entity> {
        let url = self.url_for(entity_type, Some(id))?;
        let payload = self.send(Method::Get, url, QueryParams::new(), None, None).await?;
        self.did_receive_data(&payload)?
            .into_iter()
            .find(|r| r.entity_type() == entity_type && r.id() == Some(id))
            .ok_or_else(|| FlushError::MissingRecord {
                entity_type: entity_type.clone(),
                id: id.to_string(),
            })
    }

    async fn query(
        &self,
        entity_type: &EntityType,
        params: &QueryParams,
    ) -> FlushResult<Vec<Entity>> {
        let url = self.url_for(entity_type, None)?;
        let payload = self.send(Method::Get, url, params.clone(), None, None).await?;
        Ok(self
            .did_receive_data(&payload)?
            .into_iter()
            .filter(|r| r.entity_type() == entity_type)
            .collect())
    }
}
