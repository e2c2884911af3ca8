//! Common test utilities for reconciliation-workflow integration tests.

use reconciliation_workflow::collaborators::{Collaborators, ImportFile, InMemoryEntities};
use reconciliation_workflow::config::WorkflowConfig;
use reconciliation_workflow::services::{ReconciliationWorkflow, WorkflowSettings};
use reconciliation_workflow::startup::Application;
use service_core::config::Config as CommonConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_workflow=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config() -> WorkflowConfig {
    WorkflowConfig {
        common: CommonConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        },
        service_name: "reconciliation-workflow-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        ..WorkflowConfig::default()
    }
}

/// Test application wrapper.
#[allow(dead_code)]
pub struct TestApp {
    pub address: String,
    pub http: reqwest::Client,
    pub client_id: Uuid,
    pub entities: Arc<InMemoryEntities>,
    pub workflow: Arc<ReconciliationWorkflow>,
}

#[allow(dead_code)]
impl TestApp {
    pub fn api(&self, path: &str) -> String {
        format!("{}/api/v1/clients/{}{}", self.address, self.client_id, path)
    }
}

/// Spawn the application on a random port with in-process collaborators and
/// a fresh client id.
#[allow(dead_code)]
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let entities = Arc::new(InMemoryEntities::new());
    let app = Application::build_with(test_config(), Collaborators::in_process(entities.clone()))
        .await
        .expect("Failed to build application");

    let address = format!("http://127.0.0.1:{}", app.http_port());
    let workflow = app.workflow();

    // Start the application in the background
    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    TestApp {
        address,
        http: reqwest::Client::new(),
        client_id: Uuid::new_v4(),
        entities,
        workflow,
    }
}

/// A workflow without the HTTP layer.
#[allow(dead_code)]
pub fn workflow() -> (Arc<ReconciliationWorkflow>, Arc<InMemoryEntities>) {
    init_tracing();
    let entities = Arc::new(InMemoryEntities::new());
    let workflow = ReconciliationWorkflow::new(
        Collaborators::in_process(entities.clone()),
        WorkflowSettings::default(),
    );
    (Arc::new(workflow), entities)
}

/// Semicolon CSV with the standard header; each line is
/// `date;amount;description;counterparty;iban;reference`.
#[allow(dead_code)]
pub fn statement(lines: &[String]) -> ImportFile {
    let mut content = String::from("date;amount;description;counterparty;iban;reference\n");
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    ImportFile {
        file_name: "statement.csv".to_string(),
        content: content.into_bytes(),
    }
}
