use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use keel_common::{
    ArtifactReference, Digest, Endpoint, EndpointStatus, ModelResource, Selector,
    ServingConfiguration,
};

use crate::types::{
    HostingPlatform, ImageDescription, ModelDescription, Registry, RemoteError, ResourceKind,
};

/// Remote operation, as recorded in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    DescribeImage,
    DescribeModel,
    DeleteModel,
    CreateModel,
    CreateServingConfiguration,
    DescribeEndpoint,
    CreateEndpoint,
    UpdateEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub seq: u64,
    pub call: Call,
    pub name: String,
    pub outcome: CallOutcome,
    /// Endpoint status returned by a successful describe.
    pub observed: Option<EndpointStatus>,
}

/// In-process control plane with eventually-consistent behaviour.
///
/// Deleted models stay visible for `deletion_lag` describes; endpoint
/// transitions complete after `transition_polls` describes. Every call is
/// journaled so callers can assert on ordering.
#[derive(Debug, Clone)]
pub struct MemoryControlPlane {
    inner: Arc<Mutex<Inner>>,
    transition_polls: u32,
    deletion_lag: u32,
    resolve_tags: bool,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    images: HashMap<(String, String), Digest>,
    models: BTreeMap<String, ModelRecord>,
    configurations: BTreeMap<String, ServingConfiguration>,
    endpoints: BTreeMap<String, EndpointRecord>,
    journal: Vec<CallRecord>,
    faults: HashMap<Call, VecDeque<RemoteError>>,
    fail_next_transition: Option<String>,
    next_model_image: Option<String>,
}

#[derive(Debug)]
struct ModelRecord {
    model: ModelDescription,
    /// Describes left before a deleted model disappears.
    deleting: Option<u32>,
}

#[derive(Debug)]
struct EndpointRecord {
    endpoint: Endpoint,
    pending: Option<Transition>,
}

#[derive(Debug)]
struct Transition {
    polls_left: u32,
    configuration: String,
    image: Option<String>,
    failure: Option<String>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            transition_polls: 2,
            deletion_lag: 1,
            resolve_tags: false,
        }
    }

    pub fn with_transition_polls(mut self, polls: u32) -> Self {
        self.transition_polls = polls;
        self
    }

    pub fn with_deletion_lag(mut self, describes: u32) -> Self {
        self.deletion_lag = describes;
        self
    }

    /// Resolve tag-form model images to digests when an endpoint deploys them.
    pub fn with_tag_resolution(mut self, enabled: bool) -> Self {
        self.resolve_tags = enabled;
        self
    }

    pub async fn put_image(&self, repository: &str, tag: &str, digest: Digest) {
        let mut inner = self.inner.lock().await;
        inner
            .images
            .insert((repository.to_string(), tag.to_string()), digest);
    }

    pub async fn put_model(&self, model: &ModelResource) {
        let mut inner = self.inner.lock().await;
        inner.models.insert(
            model.name.clone(),
            ModelRecord {
                model: describe(model),
                deleting: None,
            },
        );
    }

    /// Seed an endpoint. A transitioning status settles to `InService` after
    /// `transition_polls` describes.
    pub async fn put_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.lock().await;
        let pending = endpoint.status.is_transitioning().then(|| Transition {
            polls_left: self.transition_polls,
            configuration: endpoint.active_configuration.clone(),
            image: endpoint.deployed_image.clone(),
            failure: None,
        });
        inner
            .endpoints
            .insert(endpoint.name.clone(), EndpointRecord { endpoint, pending });
    }

    /// Queue an error for the next call of `call`.
    pub async fn inject_fault(&self, call: Call, err: RemoteError) {
        let mut inner = self.inner.lock().await;
        inner.faults.entry(call).or_default().push_back(err);
    }

    /// Make the next endpoint create/update settle in `Failed`.
    pub async fn fail_next_transition(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_next_transition = Some(reason.into());
    }

    /// Record `image` instead of the requested one on the next model create.
    pub async fn override_next_model_image(&self, image: impl Into<String>) {
        self.inner.lock().await.next_model_image = Some(image.into());
    }

    pub async fn journal(&self) -> Vec<CallRecord> {
        self.inner.lock().await.journal.clone()
    }

    pub async fn call_count(&self, call: Call) -> usize {
        let inner = self.inner.lock().await;
        inner.journal.iter().filter(|r| r.call == call).count()
    }

    /// Current model state, without advancing any pending deletion.
    pub async fn model(&self, name: &str) -> Option<ModelDescription> {
        let inner = self.inner.lock().await;
        inner
            .models
            .get(name)
            .filter(|r| r.deleting.is_none())
            .map(|r| r.model.clone())
    }

    /// Current endpoint state, without advancing any pending transition.
    pub async fn endpoint(&self, name: &str) -> Option<Endpoint> {
        let inner = self.inner.lock().await;
        inner.endpoints.get(name).map(|r| r.endpoint.clone())
    }

    pub async fn configurations(&self) -> Vec<ServingConfiguration> {
        let inner = self.inner.lock().await;
        inner.configurations.values().cloned().collect()
    }

    fn deployed_image(&self, inner: &Inner, configuration: &str) -> Option<String> {
        let config = inner.configurations.get(configuration)?;
        let record = inner.models.get(&config.model_name)?;
        let image = record.model.image.clone();
        if !self.resolve_tags {
            return Some(image);
        }
        match ArtifactReference::parse(&image) {
            Ok(r) => match &r.selector {
                Selector::Tag(tag) => inner
                    .images
                    .get(&(r.repository.clone(), tag.clone()))
                    .map(|d| r.pinned(d.clone()).uri())
                    .or(Some(image)),
                Selector::Digest(_) => Some(image),
            },
            Err(_) => Some(image),
        }
    }

    fn begin_transition(&self, inner: &mut Inner, configuration: &str) -> Transition {
        Transition {
            polls_left: self.transition_polls,
            configuration: configuration.to_string(),
            image: self.deployed_image(inner, configuration),
            failure: inner.fail_next_transition.take(),
        }
    }
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(model: &ModelResource) -> ModelDescription {
    ModelDescription {
        name: model.name.clone(),
        image: model.artifact.uri(),
        execution_role: model.execution_identity.clone(),
        environment: model.environment.clone(),
    }
}

impl Inner {
    fn take_fault(&mut self, call: Call) -> Option<RemoteError> {
        self.faults.get_mut(&call).and_then(VecDeque::pop_front)
    }

    fn record<T>(
        &mut self,
        call: Call,
        name: &str,
        result: &Result<T, RemoteError>,
        observed: Option<EndpointStatus>,
    ) {
        self.seq += 1;
        let outcome = match result {
            Ok(_) => CallOutcome::Ok,
            Err(e) if e.is_not_found() => CallOutcome::NotFound,
            Err(_) => CallOutcome::Failed,
        };
        self.journal.push(CallRecord {
            seq: self.seq,
            call,
            name: name.to_string(),
            outcome,
            observed,
        });
    }

    fn require_configuration(&self, configuration: &str) -> Result<(), RemoteError> {
        if self.configurations.contains_key(configuration) {
            Ok(())
        } else {
            Err(RemoteError::Rejected(format!(
                "serving configuration '{configuration}' does not exist"
            )))
        }
    }
}

#[async_trait]
impl Registry for MemoryControlPlane {
    async fn describe_image_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<ImageDescription, RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::DescribeImage) {
            Some(e) => Err(e),
            None => inner
                .images
                .get(&(repository.to_string(), tag.to_string()))
                .map(|digest| ImageDescription {
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                    digest: digest.clone(),
                })
                .ok_or_else(|| {
                    RemoteError::not_found(ResourceKind::Image, format!("{repository}:{tag}"))
                }),
        };
        inner.record(Call::DescribeImage, repository, &result, None);
        result
    }
}

#[async_trait]
impl HostingPlatform for MemoryControlPlane {
    async fn describe_model(&self, name: &str) -> Result<ModelDescription, RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::DescribeModel) {
            Some(e) => Err(e),
            None => {
                let gone = match inner.models.get_mut(name) {
                    None => true,
                    Some(record) => match record.deleting {
                        Some(0) => true,
                        Some(ref mut left) => {
                            *left -= 1;
                            false
                        }
                        None => false,
                    },
                };
                if gone {
                    inner.models.remove(name);
                    Err(RemoteError::not_found(ResourceKind::Model, name))
                } else {
                    Ok(inner.models[name].model.clone())
                }
            }
        };
        inner.record(Call::DescribeModel, name, &result, None);
        result
    }

    async fn delete_model(&self, name: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let lag = self.deletion_lag;
        let result = match inner.take_fault(Call::DeleteModel) {
            Some(e) => Err(e),
            None => match inner.models.get_mut(name) {
                None => Err(RemoteError::not_found(ResourceKind::Model, name)),
                Some(record) => {
                    if record.deleting.is_none() {
                        record.deleting = Some(lag);
                    }
                    Ok(())
                }
            },
        };
        inner.record(Call::DeleteModel, name, &result, None);
        result
    }

    async fn create_model(&self, model: &ModelResource) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::CreateModel) {
            Some(e) => Err(e),
            None if inner.models.contains_key(&model.name) => Err(RemoteError::conflict(
                ResourceKind::Model,
                &model.name,
                "model already exists",
            )),
            None => {
                let mut description = describe(model);
                if let Some(image) = inner.next_model_image.take() {
                    description.image = image;
                }
                inner.models.insert(
                    model.name.clone(),
                    ModelRecord {
                        model: description,
                        deleting: None,
                    },
                );
                Ok(())
            }
        };
        inner.record(Call::CreateModel, &model.name, &result, None);
        result
    }

    async fn create_serving_configuration(
        &self,
        config: &ServingConfiguration,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::CreateServingConfiguration) {
            Some(e) => Err(e),
            None if inner.configurations.contains_key(&config.name) => Err(RemoteError::conflict(
                ResourceKind::ServingConfiguration,
                &config.name,
                "serving configuration already exists",
            )),
            None if !inner.models.contains_key(&config.model_name) => Err(RemoteError::Rejected(
                format!("model '{}' does not exist", config.model_name),
            )),
            None => {
                inner
                    .configurations
                    .insert(config.name.clone(), config.clone());
                Ok(())
            }
        };
        inner.record(Call::CreateServingConfiguration, &config.name, &result, None);
        result
    }

    async fn describe_endpoint(&self, name: &str) -> Result<Endpoint, RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::DescribeEndpoint) {
            Some(e) => Err(e),
            None => match inner.endpoints.get_mut(name) {
                None => Err(RemoteError::not_found(ResourceKind::Endpoint, name)),
                Some(record) => {
                    let settled = match record.pending.as_mut() {
                        Some(t) => {
                            t.polls_left = t.polls_left.saturating_sub(1);
                            t.polls_left == 0
                        }
                        None => false,
                    };
                    if settled {
                        if let Some(t) = record.pending.take() {
                            let ep = &mut record.endpoint;
                            match t.failure {
                                Some(reason) => {
                                    ep.status = EndpointStatus::Failed;
                                    ep.failure_reason = Some(reason);
                                }
                                None => {
                                    ep.status = EndpointStatus::InService;
                                    ep.active_configuration = t.configuration;
                                    ep.deployed_image = t.image;
                                    ep.failure_reason = None;
                                }
                            }
                        }
                    }
                    Ok(record.endpoint.clone())
                }
            },
        };
        let observed = result.as_ref().ok().map(|ep| ep.status);
        inner.record(Call::DescribeEndpoint, name, &result, observed);
        result
    }

    async fn create_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::CreateEndpoint) {
            Some(e) => Err(e),
            None if inner.endpoints.contains_key(name) => Err(RemoteError::conflict(
                ResourceKind::Endpoint,
                name,
                "endpoint already exists",
            )),
            None => inner.require_configuration(configuration).map(|()| {
                let transition = self.begin_transition(&mut inner, configuration);
                let endpoint = Endpoint {
                    name: name.to_string(),
                    active_configuration: configuration.to_string(),
                    status: EndpointStatus::Creating,
                    deployed_image: None,
                    failure_reason: None,
                };
                inner.endpoints.insert(
                    name.to_string(),
                    EndpointRecord {
                        endpoint,
                        pending: Some(transition),
                    },
                );
            }),
        };
        inner.record(Call::CreateEndpoint, name, &result, None);
        result
    }

    async fn update_endpoint(&self, name: &str, configuration: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let result = match inner.take_fault(Call::UpdateEndpoint) {
            Some(e) => Err(e),
            None => match inner.endpoints.get(name).map(|r| r.endpoint.status) {
                None => Err(RemoteError::not_found(ResourceKind::Endpoint, name)),
                Some(status) if status.is_transitioning() => Err(RemoteError::conflict(
                    ResourceKind::Endpoint,
                    name,
                    format!("cannot update endpoint while {status}"),
                )),
                Some(_) => inner.require_configuration(configuration).map(|()| {
                    let transition = self.begin_transition(&mut inner, configuration);
                    if let Some(record) = inner.endpoints.get_mut(name) {
                        record.endpoint.status = EndpointStatus::Updating;
                        record.pending = Some(transition);
                    }
                }),
            },
        };
        inner.record(Call::UpdateEndpoint, name, &result, None);
        result
    }
}
