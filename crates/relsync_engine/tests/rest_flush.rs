//! Integration tests for flushing sessions through the REST adapter.

use async_trait::async_trait;
use parking_lot::Mutex;
use relsync_engine::{
    AdapterConfig, DependencyGraph, FlushConfig, FlushEngine, HttpClient, HttpRequest,
    HttpResponse, Method, RestAdapter,
};
use relsync_model::{Entity, EntityDef, Schema, Session};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Answers every write by echoing the sent record, with a fresh id for
/// POSTs and the URL's id otherwise. Has-many collections are never echoed.
struct EchoServer {
    next_id: AtomicU64,
    requests: Mutex<Vec<HttpRequest>>,
}

impl EchoServer {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HttpClient for EchoServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        self.requests.lock().push(request.clone());
        tokio::task::yield_now().await;

        let Some(Value::Object(body)) = request.body else {
            return Ok(HttpResponse::new(204, Value::Null));
        };
        let id = match request.method {
            Method::Post => json!(self.next_id.fetch_add(1, Ordering::SeqCst)),
            _ => json!(request.url.rsplit('/').next().unwrap_or_default()),
        };

        let mut response = Map::new();
        for (root, record) in body {
            let mut record = record.as_object().cloned().unwrap_or_default();
            record.insert("id".to_string(), id.clone());
            response.insert(root, Value::Object(record));
        }
        Ok(HttpResponse::new(200, Value::Object(response)))
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new()
            .with_type(
                EntityDef::new("post")
                    .attribute("title")
                    .has_many("comments", "comment"),
            )
            .with_type(
                EntityDef::new("comment")
                    .attribute("body")
                    .belongs_to("post", "post"),
            ),
    )
}

fn engine(session: &Session) -> FlushEngine<RestAdapter<EchoServer>> {
    let config = AdapterConfig::new("https://api.example.com").with_namespace("v1");
    let adapter = RestAdapter::for_session(config, EchoServer::new(), session).unwrap();
    FlushEngine::new(FlushConfig::default(), adapter)
}

fn sent_requests(engine: &FlushEngine<RestAdapter<EchoServer>>) -> Vec<HttpRequest> {
    engine.store().client().requests.lock().clone()
}

#[tokio::test]
async fn comment_is_posted_with_its_post_server_id() {
    let session = Session::new(schema());
    let engine = engine(&session);

    let post = session.create(&"post".into()).unwrap();
    session.set_attribute(post, "title", "Hello").unwrap();
    let comment = session.create(&"comment".into()).unwrap();
    session.set_attribute(comment, "body", "First").unwrap();
    session.set_belongs_to(comment, "post", Some(post)).unwrap();

    let report = engine.flush(&session).await.unwrap();
    assert_eq!(report.entities.len(), 2);

    let post_id = session.get(post).unwrap().id().unwrap().to_string();
    let requests = sent_requests(&engine);
    assert_eq!(requests.len(), 2);

    assert_eq!(requests[0].method, Method::Post);
    assert_eq!(requests[0].url, "https://api.example.com/v1/posts");
    assert_eq!(requests[0].body, Some(json!({"post": {"title": "Hello"}})));

    assert_eq!(requests[1].method, Method::Post);
    assert_eq!(requests[1].url, "https://api.example.com/v1/comments");
    assert_eq!(
        requests[1].body,
        Some(json!({"comment": {"body": "First", "post_id": post_id}}))
    );

    // The post's response carried no comments; reconciliation fills them in.
    assert_eq!(session.get(post).unwrap().has_many("comments"), &[comment]);
    assert_eq!(session.get(comment).unwrap().belongs_to("post"), Some(post));
    assert!(DependencyGraph::build(&session).unwrap().roots().is_empty());

    let again = engine.flush(&session).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(sent_requests(&engine).len(), 2);
}

#[tokio::test]
async fn update_is_put_without_id_in_body() {
    let session = Session::new(schema());
    let engine = engine(&session);

    let def = session.schema().entity(&"post".into()).unwrap().clone();
    let mut post = Entity::persisted(&def, session.identity_map().allocate(), "7");
    post.set_attribute("title", "A");
    let post = session.track(post).unwrap();
    session.set_attribute(post, "title", "B").unwrap();

    engine.flush(&session).await.unwrap();

    let requests = sent_requests(&engine);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::Put);
    assert_eq!(requests[0].url, "https://api.example.com/v1/posts/7");
    assert_eq!(requests[0].body, Some(json!({"post": {"title": "B"}})));

    let snapshot = session.identity_map().snapshot(post).unwrap();
    assert_eq!(snapshot.attribute("title"), Some(&json!("B")));
    assert!(DependencyGraph::build(&session).unwrap().roots().is_empty());
}
