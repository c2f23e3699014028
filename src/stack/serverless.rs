//! Serverless projects.
//!
//! The create response never carries usable credentials, so a project is
//! created and then its credentials are reset. Endpoints show up later and
//! are polled for separately. Serverless Elasticsearch does not expose the
//! cluster health API, so readiness is decided by HTTP status codes alone.

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

pub const NAME: &str = "serverless";

/// `internal` key holding the remote project ID.
pub const PROJECT_ID: &str = "project_id";
/// `internal` key holding the project type.
pub const PROJECT_TYPE: &str = "project_type";

pub struct ServerlessProvisioner {
    config: EssConfig,
    client: EssClient,
    span: tracing::Span,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: String,
    #[serde(default)]
    endpoints: Endpoints,
}

#[derive(Debug, Default, Deserialize)]
struct Endpoints {
    #[serde(default)]
    elasticsearch: Option<String>,
    #[serde(default)]
    kibana: Option<String>,
}

impl Endpoints {
    fn complete(&self) -> Option<(String, String)> {
        match (&self.elasticsearch, &self.kibana) {
            (Some(es), Some(kb)) if !es.is_empty() && !kb.is_empty() => {
                Some((es.clone(), kb.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

impl ServerlessProvisioner {
    pub fn new(config: EssConfig) -> StackResult<Self> {
        let client = EssClient::new(&config)?;
        Ok(Self {
            config,
            client,
            span: tracing::Span::none(),
        })
    }

    fn project_path(project_type: &str, id: &str) -> String {
        format!("/api/v1/serverless/projects/{}/{}", project_type, id)
    }

    async fn endpoints_ready(&self, stack: &Stack) -> StackResult<bool> {
        let es = self
            .client
            .status_of(&stack.elasticsearch, &stack.username, &stack.password)
            .await?;
        let kb = self
            .client
            .status_of(
                &format!("{}/api/status", stack.kibana.trim_end_matches('/')),
                &stack.username,
                &stack.password,
            )
            .await?;
        debug!(parent: &self.span, "Project {} health: elasticsearch {}, kibana {}", stack.id, es, kb);
        Ok(es == 200 && kb == 200)
    }
}

fn internal<'a>(stack: &'a Stack, key: &str) -> StackResult<&'a str> {
    stack
        .internal
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| StackError::Parse(format!("stack {} has no {}", stack.id, key)))
}

#[async_trait]
impl StackProvisioner for ServerlessProvisioner {
    fn name(&self) -> &str {
        NAME
    }

    fn set_logger(&mut self, span: tracing::Span) {
        self.span = span;
    }

    async fn create(&self, request: &StackRequest) -> StackResult<Stack> {
        let project_type = self.config.project_type.as_str();
        let name = format!(
            "integrun-{}-{}",
            request.id,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        info!(parent: &self.span, "Creating {} project {}", project_type, name);
        let body = json!({"name": name, "region_id": self.config.region});
        let project: Project = self
            .client
            .request(
                Method::POST,
                &format!("/api/v1/serverless/projects/{}", project_type),
                Some(&body),
            )
            .await?;

        let credentials: Credentials = self
            .client
            .request::<(), _>(
                Method::POST,
                &format!("{}/_reset-credentials", Self::project_path(project_type, &project.id)),
                None,
            )
            .await?;

        let mut internal = BTreeMap::new();
        internal.insert(PROJECT_ID.to_string(), project.id.clone());
        internal.insert(PROJECT_TYPE.to_string(), project_type.to_string());
        Ok(Stack {
            id: request.id.clone(),
            provisioner: NAME.to_string(),
            version: request.version.clone(),
            ready: false,
            elasticsearch: project.endpoints.elasticsearch.unwrap_or_default(),
            kibana: project.endpoints.kibana.unwrap_or_default(),
            username: credentials.username,
            password: credentials.password,
            internal,
        })
    }

    async fn wait_for_ready(&self, mut stack: Stack) -> StackResult<Stack> {
        let project_id = internal(&stack, PROJECT_ID)?.to_string();
        let path = Self::project_path(internal(&stack, PROJECT_TYPE)?, &project_id);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let limit = Duration::from_secs(self.config.ready_timeout_secs);
        info!(parent: &self.span, "Waiting for project {}", project_id);

        let (client, path_ref) = (&self.client, &path);
        let (es, kb) = poll_until(
            &format!("project {} endpoints", project_id),
            interval,
            limit,
            || async move {
                let project: Project = client.request::<(), _>(Method::GET, path_ref, None).await?;
                Ok(project.endpoints.complete())
            },
        )
        .await?;
        stack.elasticsearch = es;
        stack.kibana = kb;

        let current = &stack;
        poll_until(
            &format!("project {} health", project_id),
            interval,
            limit,
            || async move { Ok(self.endpoints_ready(current).await?.then_some(())) },
        )
        .await?;

        stack.ready = true;
        info!(parent: &self.span, "Project {} ready at {}", project_id, stack.elasticsearch);
        Ok(stack)
    }

    async fn delete(&self, stack: &Stack) -> StackResult<()> {
        let path = Self::project_path(internal(stack, PROJECT_TYPE)?, internal(stack, PROJECT_ID)?);
        info!(parent: &self.span, "Deleting project {}", stack.id);
        let _: serde_json::Value = self
            .client
            .request::<(), _>(Method::DELETE, &path, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::client::mock::MockApi;

    #[test]
    fn test_project_without_endpoints() {
        let project: Project = serde_json::from_str(r#"{"id": "p1"}"#).unwrap();
        assert_eq!(project.id, "p1");
        assert!(project.endpoints.complete().is_none());
    }

    #[test]
    fn test_endpoints_need_both_services() {
        let partial: Project = serde_json::from_str(
            r#"{"id": "p1", "endpoints": {"elasticsearch": "https://es.example", "kibana": ""}}"#,
        )
        .unwrap();
        assert!(partial.endpoints.complete().is_none());

        let full: Project = serde_json::from_str(
            r#"{"id": "p1", "endpoints": {"elasticsearch": "https://es.example", "kibana": "https://kb.example"}}"#,
        )
        .unwrap();
        assert_eq!(
            full.endpoints.complete(),
            Some(("https://es.example".to_string(), "https://kb.example".to_string()))
        );
    }

    #[test]
    fn test_project_path() {
        assert_eq!(
            ServerlessProvisioner::project_path("observability", "abc"),
            "/api/v1/serverless/projects/observability/abc"
        );
    }

    #[test]
    fn test_internal_lookup() {
        let stack = Stack {
            id: "8100".to_string(),
            provisioner: NAME.to_string(),
            version: "8.10.0".to_string(),
            ready: false,
            elasticsearch: String::new(),
            kibana: String::new(),
            username: String::new(),
            password: String::new(),
            internal: BTreeMap::from([(PROJECT_ID.to_string(), "abc".to_string())]),
        };
        assert_eq!(internal(&stack, PROJECT_ID).unwrap(), "abc");
        assert!(matches!(internal(&stack, PROJECT_TYPE), Err(StackError::Parse(_))));
    }

    fn project_stack() -> Stack {
        Stack {
            id: "8100".to_string(),
            provisioner: NAME.to_string(),
            version: "8.10.0".to_string(),
            ready: false,
            elasticsearch: String::new(),
            kibana: String::new(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            internal: BTreeMap::from([
                (PROJECT_ID.to_string(), "p1".to_string()),
                (PROJECT_TYPE.to_string(), "observability".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_create_resets_credentials() {
        let mut api = MockApi::bind().await;
        api.serve(vec![
            (201, r#"{"id": "p1"}"#.to_string()),
            (200, r#"{"username": "admin", "password": "fresh"}"#.to_string()),
        ]);
        let p = ServerlessProvisioner::new(api.config()).unwrap();

        let stack = p.create(&StackRequest::for_version("8.10.0")).await.unwrap();
        assert_eq!(stack.internal[PROJECT_ID], "p1");
        assert_eq!(stack.internal[PROJECT_TYPE], "observability");
        assert_eq!(stack.password, "fresh");
        assert!(stack.elasticsearch.is_empty());
        assert_eq!(
            api.request_lines(),
            [
                "POST /api/v1/serverless/projects/observability",
                "POST /api/v1/serverless/projects/observability/p1/_reset-credentials",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_fails_when_reset_is_forbidden() {
        let mut api = MockApi::bind().await;
        api.serve(vec![
            (201, r#"{"id": "p1"}"#.to_string()),
            (403, r#"{"errors": ["forbidden"]}"#.to_string()),
        ]);
        let p = ServerlessProvisioner::new(api.config()).unwrap();

        let res = p.create(&StackRequest::for_version("8.10.0")).await;
        assert!(matches!(res, Err(StackError::Api { status: 403, .. })));
    }

    #[tokio::test]
    async fn test_wait_for_ready_polls_endpoints_then_health() {
        let mut api = MockApi::bind().await;
        let es = format!("{}/es", api.url);
        let kb = format!("{}/kb", api.url);
        let endpoints = json!({"id": "p1", "endpoints": {"elasticsearch": es, "kibana": kb}});
        api.serve(vec![
            (200, r#"{"id": "p1"}"#.to_string()),
            (200, endpoints.to_string()),
            (503, String::new()),
            (200, String::new()),
            (200, String::new()),
            (200, String::new()),
        ]);
        let p = ServerlessProvisioner::new(api.config()).unwrap();

        let stack = p.wait_for_ready(project_stack()).await.unwrap();
        assert!(stack.ready);
        assert_eq!(stack.elasticsearch, es);
        assert_eq!(stack.kibana, kb);
        assert_eq!(
            api.request_lines(),
            [
                "GET /api/v1/serverless/projects/observability/p1",
                "GET /api/v1/serverless/projects/observability/p1",
                "GET /es",
                "GET /kb/api/status",
                "GET /es",
                "GET /kb/api/status",
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_project() {
        let mut api = MockApi::bind().await;
        api.serve(vec![(200, "{}".to_string())]);
        let p = ServerlessProvisioner::new(api.config()).unwrap();

        p.delete(&project_stack()).await.unwrap();
        assert_eq!(
            api.request_lines(),
            ["DELETE /api/v1/serverless/projects/observability/p1"]
        );
    }
}
