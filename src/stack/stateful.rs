//! Long-lived deployments.
//!
//! A deployment is ready once every component (Elasticsearch, Kibana,
//! integrations server) reports `started`. Credentials are only returned by
//! the create call, so they are kept on the [`Stack`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    EssClient, Stack, StackError, StackProvisioner, StackRequest, StackResult, poll_until,
};
use crate::config::EssConfig;

pub const NAME: &str = "stateful";

/// `internal` key holding the remote deployment ID.
pub const DEPLOYMENT_ID: &str = "deployment_id";

const STARTED: &str = "started";

pub struct StatefulProvisioner {
    config: EssConfig,
    client: EssClient,
    span: tracing::Span,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    resources: Vec<CreatedResource>,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    kind: String,
    #[serde(default)]
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    resources: Resources,
}

#[derive(Debug, Default, Deserialize)]
struct Resources {
    #[serde(default)]
    elasticsearch: Vec<Resource>,
    #[serde(default)]
    kibana: Vec<Resource>,
    #[serde(default)]
    integrations_server: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    info: ResourceInfo,
}

#[derive(Debug, Deserialize)]
struct ResourceInfo {
    status: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    service_url: Option<String>,
}

impl Deployment {
    fn components(&self) -> [(&'static str, &[Resource]); 3] {
        [
            ("elasticsearch", self.resources.elasticsearch.as_slice()),
            ("kibana", self.resources.kibana.as_slice()),
            ("integrations_server", self.resources.integrations_server.as_slice()),
        ]
    }

    /// `started` when every component is started, otherwise the status of
    /// the first component that is not.
    pub fn status(&self) -> String {
        for (_, resources) in self.components() {
            let status = resources
                .first()
                .map(|r| r.info.status.as_str())
                .unwrap_or("initializing");
            if status != STARTED {
                return status.to_string();
            }
        }
        STARTED.to_string()
    }

    fn endpoint(resources: &[Resource]) -> String {
        resources
            .first()
            .and_then(|r| r.info.metadata.service_url.clone())
            .unwrap_or_default()
    }
}

impl StatefulProvisioner {
    pub fn new(config: EssConfig) -> StackResult<Self> {
        let client = EssClient::new(&config)?;
        Ok(Self {
            config,
            client,
            span: tracing::Span::none(),
        })
    }

    fn create_body(&self, name: &str, version: &str) -> serde_json::Value {
        let region = self.config.region.as_str();
        json!({
            "name": name,
            "metadata": {
                "tags": [
                    {"key": "created_by", "value": "integrun"},
                    {"key": "stack_version", "value": version},
                ]
            },
            "resources": {
                "elasticsearch": [{
                    "region": region,
                    "ref_id": "main-elasticsearch",
                    "plan": {
                        "elasticsearch": {"version": version},
                        "deployment_template": {"id": self.config.deployment_template},
                        "cluster_topology": [{
                            "id": "hot_content",
                            "zone_count": 1,
                            "size": {"resource": "memory", "value": 8192}
                        }]
                    }
                }],
                "kibana": [{
                    "region": region,
                    "ref_id": "main-kibana",
                    "elasticsearch_cluster_ref_id": "main-elasticsearch",
                    "plan": {"kibana": {"version": version}}
                }],
                "integrations_server": [{
                    "region": region,
                    "ref_id": "main-integrations_server",
                    "elasticsearch_cluster_ref_id": "main-elasticsearch",
                    "plan": {"integrations_server": {"version": version}}
                }]
            }
        })
    }
}

fn deployment_id(stack: &Stack) -> StackResult<&str> {
    stack
        .internal
        .get(DEPLOYMENT_ID)
        .map(String::as_str)
        .ok_or_else(|| StackError::Parse(format!("stack {} has no {}", stack.id, DEPLOYMENT_ID)))
}

#[async_trait]
impl StackProvisioner for StatefulProvisioner {
    fn name(&self) -> &str {
        NAME
    }

    fn set_logger(&mut self, span: tracing::Span) {
        self.span = span;
    }

    async fn create(&self, request: &StackRequest) -> StackResult<Stack> {
        let name = format!(
            "integrun-{}-{}",
            request.id,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        info!(parent: &self.span, "Creating deployment {} ({})", name, request.version);
        let body = self.create_body(&name, &request.version);
        let created: CreateResponse = self
            .client
            .request(Method::POST, "/api/v1/deployments", Some(&body))
            .await?;

        let credentials = created
            .resources
            .iter()
            .find(|r| r.kind == "elasticsearch")
            .and_then(|r| r.credentials.as_ref())
            .ok_or_else(|| StackError::Parse("create response carries no credentials".to_string()))?;

        let mut internal = BTreeMap::new();
        internal.insert(DEPLOYMENT_ID.to_string(), created.id.clone());
        Ok(Stack {
            id: request.id.clone(),
            provisioner: NAME.to_string(),
            version: request.version.clone(),
            ready: false,
            elasticsearch: String::new(),
            kibana: String::new(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            internal,
        })
    }

    async fn wait_for_ready(&self, mut stack: Stack) -> StackResult<Stack> {
        let id = deployment_id(&stack)?.to_string();
        let path = format!("/api/v1/deployments/{}", id);
        info!(parent: &self.span, "Waiting for deployment {}", id);

        let (client, span, path, id_ref) = (&self.client, &self.span, &path, &id);
        let deployment: Deployment = poll_until(
            &format!("deployment {}", id),
            Duration::from_secs(self.config.poll_interval_secs),
            Duration::from_secs(self.config.ready_timeout_secs),
            || async move {
                let deployment: Deployment =
                    client.request::<(), _>(Method::GET, path, None).await?;
                let status = deployment.status();
                debug!(parent: span, "Deployment {} is {}", id_ref, status);
                Ok((status == STARTED).then_some(deployment))
            },
        )
        .await?;

        stack.elasticsearch = Deployment::endpoint(&deployment.resources.elasticsearch);
        stack.kibana = Deployment::endpoint(&deployment.resources.kibana);
        stack.ready = true;
        info!(parent: &self.span, "Deployment {} ready at {}", id, stack.elasticsearch);
        Ok(stack)
    }

    async fn delete(&self, stack: &Stack) -> StackResult<()> {
        let id = deployment_id(stack)?;
        info!(parent: &self.span, "Shutting down deployment {}", id);
        let _: serde_json::Value = self
            .client
            .request::<(), _>(
                Method::POST,
                &format!("/api/v1/deployments/{}/_shutdown", id),
                None,
            )
            .await?;
        Ok(())
    }
}
