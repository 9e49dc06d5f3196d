use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keel_common::{Endpoint, ModelResource, ServingConfiguration};

use crate::types::{
    HostingPlatform, ImageDescription, ModelDescription, Registry, RemoteError, ResourceKind,
};

/// JSON-over-HTTP binding of the registry and hosting operations.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateModelBody<'a> {
    name: &'a str,
    image: String,
    execution_role: &'a str,
    environment: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct EndpointCommandBody<'a> {
    name: &'a str,
    configuration_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Response, RemoteError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(text);
        tracing::debug!(%status, %kind, %name, %message, "control plane returned error");
        Err(classify(status, kind, name, message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        kind: ResourceKind,
        name: &str,
    ) -> Result<T, RemoteError> {
        let resp = self.send(builder, kind, name).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Map an HTTP status to the remote error taxonomy.
fn classify(status: StatusCode, kind: ResourceKind, name: &str, message: String) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::not_found(kind, name),
        StatusCode::CONFLICT => RemoteError::conflict(kind, name, message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable(format!("throttled: {message}")),
        s if s.is_server_error() => RemoteError::Unavailable(format!("{s}: {message}")),
        s => RemoteError::Rejected(format!("{s}: {message}")),
    }
}

fn seg(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[async_trait]
impl Registry for HttpControlPlane {
    async fn describe_image_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<ImageDescription, RemoteError> {
        let path = format!("/registry/repositories/{}/tags/{}", seg(repository), seg(tag));
        let name = format!("{repository}:{tag}");
        self.send_json(self.request(Method::GET, &path), ResourceKind::Image, &name)
            .await
    }
}

#[async_trait]
impl HostingPlatform for HttpControlPlane {
    async fn describe_model(&self, name: &str) -> Result<ModelDescription, RemoteError> {
        let path = format!("/models/{}", seg(name));
        self.send_json(self.request(Method::GET, &path), ResourceKind::Model, name)
            .await
    }

    async fn delete_model(&self, name: &str) -> Result<(), RemoteError> {
        let path = format!("/models/{}", seg(name));
        self.send(self.request(Method::DELETE, &path), ResourceKind::Model, name)
            .await
            .map(|_| ())
    }

    async fn create_model(&self, model: &ModelResource) -> Result<(), RemoteError> {
        let body = CreateModelBody {
            name: &model.name,
            image: model.artifact.uri(),
            execution_role: &model.execution_identity,
            environment: &model.environment,
        };
        let builder = self.request(Method::POST, "/models").json(&body);
        self.send(builder, ResourceKind::Model, &model.name)
            .await
            .map(|_| ())
    }

    async fn create_serving_configuration(
        &self,
        config: &ServingConfiguration,
    ) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::POST, "/serving-configurations")
            .json(config);
        self.send(builder, ResourceKind::ServingConfiguration, &config.name)
            .await
            .map(|_| ())
    }

    async fn describe_endpoint(&self, name: &str) -> Result<Endpoint, RemoteError> {
        let path = format!("/endpoints/{}", seg(name));
        self.send_json(self.request(Method::GET, &path), ResourceKind::Endpoint, name)
            .await
    }

    async fn create_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError> {
        let body = EndpointCommandBody {
            name,
            configuration_name: configuration,
        };
        let builder = self.request(Method::POST, "/endpoints").json(&body);
        self.send(builder, ResourceKind::Endpoint, name)
            .await
            .map(|_| ())
    }

    async fn update_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError> {
        let path = format!("/endpoints/{}", seg(name));
        let body = EndpointCommandBody {
            name,
            configuration_name: configuration,
        };
        let builder = self.request(Method::PUT, &path).json(&body);
        self.send(builder, ResourceKind::Endpoint, name)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        let k = ResourceKind::Model;
        assert!(classify(StatusCode::NOT_FOUND, k, "m", String::new()).is_not_found());
        assert!(classify(StatusCode::CONFLICT, k, "m", "busy".into()).is_conflict());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, k, "m", String::new()).is_transient());
        assert!(classify(StatusCode::BAD_GATEWAY, k, "m", String::new()).is_transient());
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, k, "m", "denied".into()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, k, "m", "bad".into()),
            RemoteError::Rejected(_)
        ));
    }

    #[test]
    fn test_url_building() {
        let cp = HttpControlPlane::new("http://cp.local/", Some(String::new())).unwrap();
        assert_eq!(cp.url("/models/a"), "http://cp.local/v1/models/a");
        assert!(cp.token.is_none());
        assert_eq!(seg("team/analyzer"), "team%2Fanalyzer");
    }
}
