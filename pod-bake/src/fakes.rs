//! In-memory fetcher and container backend for tests.

use anyhow::{anyhow, Result};
use std::{cell::RefCell, collections::BTreeMap as Map, fs, rc::Rc, time::Duration};

use crate::{
    error::BuildError,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, ImageBuildSpec,
        ImageId, ImageMetadata,
    },
    services::{ContainerBackend, FetchRequest, SourceFetcher},
};

#[derive(Default)]
pub struct FakeFetcher {
    tags: Vec<String>,
    calls: Vec<String>,
    time_out: bool,
}

impl FakeFetcher {
    pub fn with_tags(tags: &[&str]) -> FakeFetcher {
        FakeFetcher {
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn timing_out() -> FakeFetcher {
        FakeFetcher {
            time_out: true,
            ..Default::default()
        }
    }

    /// Tags fetched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.clone()
    }
}

impl SourceFetcher for FakeFetcher {
    fn fetch(&mut self, request: &FetchRequest) -> Result<(), BuildError> {
        self.calls.push(request.tag.to_owned());

        if self.time_out {
            return Err(BuildError::FetchTimeout {
                url: request.source_url.to_owned(),
                tag: request.tag.to_owned(),
                timeout: request.timeout.unwrap_or_else(|| Duration::from_secs(0)),
            });
        }

        if !self.tags.iter().any(|tag| tag == request.tag) {
            // Same shape as a partially written clone.
            let _ = fs::create_dir_all(request.destination);
            return Err(BuildError::Fetch {
                url: request.source_url.to_owned(),
                tag: request.tag.to_owned(),
                reason: format!("Remote branch {} not found in upstream origin", request.tag),
            });
        }

        fs::create_dir_all(request.destination).map_err(|err| BuildError::Fetch {
            url: request.source_url.to_owned(),
            tag: request.tag.to_owned(),
            reason: err.to_string(),
        })?;
        let _ = fs::write(request.destination.join("README"), request.tag);

        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    builds: Vec<ImageBuildSpec>,
    build_failure: Option<String>,
    images: Map<String, ImageMetadata>,
    containers: Map<ContainerName, Container>,
    exit_on_start: Option<i32>,
    operations: Vec<String>,
}

impl FakeState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:04}", prefix, self.next_id)
    }

    fn container_mut(&mut self, name: &str) -> Result<&mut Container> {
        self.containers
            .values_mut()
            .find(|container| container.id.0 == name || container.name.0 == name)
            .ok_or_else(|| anyhow!("no such container: {}", name))
    }
}

/// Clones share state, so a test can keep a handle after boxing one.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    pub fn builds(&self) -> Vec<ImageBuildSpec> {
        self.state.borrow().builds.clone()
    }

    pub fn fail_builds(&self, reason: &str) {
        self.state.borrow_mut().build_failure = Some(reason.to_owned());
    }

    /// Makes every started container exit right away with `code`.
    pub fn exit_on_start(&self, code: i32) {
        self.state.borrow_mut().exit_on_start = Some(code);
    }

    pub fn add_image(&self, name: &str, metadata: ImageMetadata) {
        self.state.borrow_mut().images.insert(name.to_owned(), metadata);
    }

    pub fn add_container(&self, container: Container) {
        self.state
            .borrow_mut()
            .containers
            .insert(container.name.clone(), container);
    }

    pub fn container(&self, name: &str) -> Option<Container> {
        self.state
            .borrow()
            .containers
            .get(&ContainerName(name.to_owned()))
            .cloned()
    }

    /// `create`, `start`, `stop` and `remove` calls as `verb name`.
    pub fn operations(&self) -> Vec<String> {
        self.state.borrow().operations.clone()
    }
}

impl ContainerBackend for FakeBackend {
    fn image_metadata(&mut self, name: &str) -> Result<Option<ImageMetadata>> {
        Ok(self.state.borrow().images.get(name).cloned())
    }

    fn build_image(&mut self, image_spec: ImageBuildSpec) -> Result<ImageId> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.build_failure.clone() {
            return Err(anyhow!(reason));
        }

        let id = state.id("sha256:");
        state.images.insert(id.clone(), image_spec.metadata.clone());
        state
            .images
            .insert(image_spec.name.0.clone(), image_spec.metadata.clone());
        state.builds.push(image_spec);

        Ok(ImageId(id))
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let containers = self
            .state
            .borrow()
            .containers
            .iter()
            .filter(|(_, container)| {
                labels.iter().all(|(label, value)| {
                    container.labels.get(*label).map(String::as_str) == Some(*value)
                })
            })
            .map(|(name, container)| (name.clone(), container.clone()))
            .collect();

        Ok(containers)
    }

    fn inspect_container(&mut self, name: &str) -> Result<Option<Container>> {
        let mut state = self.state.borrow_mut();
        Ok(state.container_mut(name).ok().map(|container| container.clone()))
    }

    fn create_container(&mut self, container_spec: ContainerSpec) -> Result<ContainerId> {
        let mut state = self.state.borrow_mut();
        if !state.images.contains_key(&container_spec.image_name.0) {
            return Err(anyhow!("no such image: {}", container_spec.image_name.0));
        }
        if state.containers.contains_key(&container_spec.name) {
            return Err(anyhow!("container name {} is in use", container_spec.name.0));
        }

        let id = ContainerId(state.id("c"));
        state
            .operations
            .push(format!("create {}", container_spec.name.0));
        state.containers.insert(
            container_spec.name.clone(),
            Container {
                id: id.clone(),
                name: container_spec.name,
                status: ContainerStatus::Configured,
                exit_code: None,
                labels: container_spec.labels,
            },
        );

        Ok(id)
    }

    fn start_container(&mut self, name: &str) -> Result<ContainerId> {
        let mut state = self.state.borrow_mut();
        let exit_on_start = state.exit_on_start;
        let container = state.container_mut(name)?;
        match exit_on_start {
            Some(code) => {
                container.status = ContainerStatus::Exited;
                container.exit_code = Some(code);
            }
            None => container.status = ContainerStatus::Running,
        }
        let (id, name) = (container.id.clone(), container.name.0.clone());
        state.operations.push(format!("start {}", name));

        Ok(id)
    }

    fn stop_container(&mut self, name: &str, _timeout: u32) -> Result<ContainerId> {
        let mut state = self.state.borrow_mut();
        let container = state.container_mut(name)?;
        container.status = ContainerStatus::Exited;
        container.exit_code = Some(143);
        let (id, name) = (container.id.clone(), container.name.0.clone());
        state.operations.push(format!("stop {}", name));

        Ok(id)
    }

    fn remove_container(&mut self, name: &str, _remove_volumes: bool) -> Result<ContainerId> {
        let mut state = self.state.borrow_mut();
        let container = state.container_mut(name)?;
        let (id, name) = (container.id.clone(), container.name.clone());
        state.containers.remove(&name);
        state.operations.push(format!("remove {}", name.0));

        Ok(id)
    }
}
