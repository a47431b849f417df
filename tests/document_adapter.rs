//! Document adapter scenarios against a mock query service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use identra_persist::backend::document::DocumentBackend;
use identra_persist::backend::{BackendOperations, OpContext};
use identra_persist::config::{DocumentConfig, PropertyMap};
use identra_persist::entry::{Entry, SearchScope};
use identra_persist::error::{HookStage, PersistError};
use identra_persist::extension::{ExtensionContext, PersistenceExtension};
use identra_persist::filter::Filter;

/// Test extension with switchable failures and a transparent "hash".
struct VetoExtension {
    fail_before: bool,
    fail_after: bool,
}

#[async_trait]
impl PersistenceExtension for VetoExtension {
    async fn on_before_create(
        &self,
        _ctx: &ExtensionContext,
        _entry: &Entry,
    ) -> anyhow::Result<()> {
        if self.fail_before {
            anyhow::bail!("create vetoed by policy");
        }
        Ok(())
    }

    async fn on_after_create(
        &self,
        _ctx: &ExtensionContext,
        _entry: &Entry,
    ) -> anyhow::Result<()> {
        if self.fail_after {
            anyhow::bail!("notification endpoint unreachable");
        }
        Ok(())
    }

    fn hash_credential(&self, plain: &str) -> anyhow::Result<String> {
        Ok(format!("hashed:{plain}"))
    }

    fn verify_credential(&self, plain: &str, stored: &str) -> anyhow::Result<bool> {
        Ok(stored == format!("hashed:{plain}"))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn config_for(server: &MockServer) -> DocumentConfig {
    DocumentConfig {
        query_url: server.uri(),
        bucket: "identra".to_string(),
        username: "admin".to_string(),
        password: "secret".to_string(),
        request_plus: false,
        substring_search: true,
    }
}

fn backend_with(
    server: &MockServer,
    extension: Option<Arc<dyn PersistenceExtension>>,
) -> DocumentBackend {
    DocumentBackend::connect(&config_for(server), "o=identra", extension, PropertyMap::new())
        .unwrap()
}

async fn mount_empty_success(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "success", "results": []})),
        )
        .mount(server)
        .await;
}

async fn requests_containing(server: &MockServer, fragment: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|request| serde_json::from_slice::<Value>(&request.body).ok())
        .filter(|body| {
            body["statement"]
                .as_str()
                .map(|s| s.contains(fragment))
                .unwrap_or(false)
        })
        .collect()
}

#[tokio::test]
async fn before_create_veto_leaves_nothing_persisted() {
    init_tracing();
    let server = MockServer::start().await;
    mount_empty_success(&server).await;

    let backend = backend_with(
        &server,
        Some(Arc::new(VetoExtension {
            fail_before: true,
            fail_after: false,
        })),
    );
    let ctx = OpContext::background();
    let entry = Entry::new("inum=B1F3,ou=people,o=identra").with_text_attribute("uid", "jdoe");

    let err = backend.add(&ctx, &entry).await.unwrap_err();
    match err {
        PersistError::Hook { stage, .. } => assert_eq!(stage, HookStage::BeforeCreate),
        other => panic!("unexpected error: {other}"),
    }

    // The native operation was never attempted...
    assert!(requests_containing(&server, "INSERT").await.is_empty());
    // ...and the entity is observably absent.
    assert!(!backend
        .exists(&ctx, "inum=B1F3,ou=people,o=identra")
        .await
        .unwrap());
}

#[tokio::test]
async fn add_hashes_credentials_through_the_extension() {
    let server = MockServer::start().await;
    mount_empty_success(&server).await;

    let backend = backend_with(
        &server,
        Some(Arc::new(VetoExtension {
            fail_before: false,
            fail_after: false,
        })),
    );
    let entry = Entry::new("inum=B1F3,ou=people,o=identra")
        .with_text_attribute("uid", "jdoe")
        .with_text_attribute("userPassword", "s3cret");

    backend.add(&OpContext::background(), &entry).await.unwrap();

    let inserts = requests_containing(&server, "INSERT").await;
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0]["args"][0], json!("people_B1F3"));
    assert_eq!(inserts[0]["args"][1]["userPassword"], json!("hashed:s3cret"));
    assert_eq!(
        inserts[0]["args"][1]["dn"],
        json!("inum=B1F3,ou=people,o=identra")
    );
}

#[tokio::test]
async fn after_create_failure_is_advisory() {
    let server = MockServer::start().await;
    mount_empty_success(&server).await;

    let backend = backend_with(
        &server,
        Some(Arc::new(VetoExtension {
            fail_before: false,
            fail_after: true,
        })),
    );
    let entry = Entry::new("inum=0A44,ou=people,o=identra").with_text_attribute("uid", "mdoe");

    let err = backend
        .add(&OpContext::background(), &entry)
        .await
        .unwrap_err();
    match err {
        PersistError::Hook { stage, .. } => {
            assert_eq!(stage, HookStage::AfterCreate);
            assert!(stage.is_advisory());
        }
        other => panic!("unexpected error: {other}"),
    }

    // The native operation committed before the hook ran.
    assert_eq!(requests_containing(&server, "INSERT").await.len(), 1);
}

#[tokio::test]
async fn unindexed_substring_search_fails_naming_the_node() {
    let server = MockServer::start().await;
    mount_empty_success(&server).await;

    let mut config = config_for(&server);
    config.substring_search = false;
    let backend =
        DocumentBackend::connect(&config, "o=identra", None, PropertyMap::new()).unwrap();

    let filter = Filter::and(vec![
        Filter::equality("uid", "jdoe").unwrap(),
        Filter::substring("cn", Some("Jo"), &[], None).unwrap(),
    ])
    .unwrap();
    let err = backend
        .search(
            &OpContext::background(),
            "ou=people,o=identra",
            SearchScope::Sub,
            &filter,
        )
        .await
        .map(|_| ())
        .unwrap_err();

    match err {
        PersistError::UnsupportedFilter { backend, node } => {
            assert_eq!(backend, "document");
            assert_eq!(node, "(cn=Jo*)");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Rejected before anything reached the backend.
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn search_decodes_documents_into_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .and(body_string_contains("SELECT RAW d"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "results": [{
                "dn": "inum=B1F3,ou=people,o=identra",
                "uid": "jdoe",
                "memberOf": ["admins", "users"]
            }]
        })))
        .mount(&server)
        .await;

    let backend = backend_with(&server, None);
    let filter = Filter::equality("uid", "jdoe").unwrap();
    let entries: Vec<Entry> = backend
        .search(
            &OpContext::background(),
            "ou=people,o=identra",
            SearchScope::Sub,
            &filter,
        )
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].dn(), "inum=B1F3,ou=people,o=identra");
    assert_eq!(entries[0].first_text("uid"), Some("jdoe"));
    assert_eq!(entries[0].attribute("memberOf").unwrap().len(), 2);
}

#[tokio::test]
async fn deadline_expiry_surfaces_cancellation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "success", "results": []}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let backend = backend_with(&server, None);
    let ctx = OpContext::background().with_deadline(Duration::from_millis(20));
    let err = backend
        .exists(&ctx, "inum=B1F3,ou=people,o=identra")
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::Cancelled(_)));
}

#[tokio::test]
async fn authenticate_verifies_through_the_extension() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "results": [{
                "dn": "inum=B1F3,ou=people,o=identra",
                "userPassword": "hashed:s3cret"
            }]
        })))
        .mount(&server)
        .await;

    let backend = backend_with(
        &server,
        Some(Arc::new(VetoExtension {
            fail_before: false,
            fail_after: false,
        })),
    );
    let ctx = OpContext::background();
    assert!(backend
        .authenticate(&ctx, "inum=B1F3,ou=people,o=identra", "s3cret")
        .await
        .unwrap());
    assert!(!backend
        .authenticate(&ctx, "inum=B1F3,ou=people,o=identra", "wrong")
        .await
        .unwrap());
}
