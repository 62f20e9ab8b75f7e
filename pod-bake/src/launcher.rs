use log::{info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{
    error::LaunchError,
    hasher,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, ImageName,
        RunSettings, RunningContainer,
    },
    services::ContainerBackend,
};

pub const LABEL_PROJECT: &str = "io.pod-bake.project";
pub const LABEL_HASH: &str = "io.pod-bake.hash";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerOperation {
    Create,
    Recreate,
    Start,
}

/// Starts and stops the containers of one project.
pub struct Launcher {
    backend: Box<dyn ContainerBackend>,
    containers: Map<ContainerName, Container>,
    project_name: String,
}

impl Launcher {
    pub fn init<B, P>(project_name: P, backend: B) -> Result<Launcher, LaunchError>
    where
        B: 'static + ContainerBackend,
        P: Into<String>,
    {
        let project_name = project_name.into();
        let mut backend = Box::new(backend);
        let containers = backend
            .list_containers(vec![(LABEL_PROJECT, project_name.as_str())])
            .map_err(|err| backend_error(&project_name, err))?;
        info!("found {} containers of {}", containers.len(), project_name);

        Ok(Launcher {
            backend,
            containers,
            project_name,
        })
    }

    pub fn container_spec(&self, image_name: &ImageName, run: &RunSettings) -> ContainerSpec {
        ContainerSpec {
            name: run.container_name.clone(),
            image_name: image_name.clone(),
            volumes: run.volumes.clone(),
            ports: run.ports.clone(),
            labels: Default::default(),
        }
    }

    /// What `up` would do to bring `spec` to a running state, if anything.
    pub fn plan(&self, spec: &ContainerSpec) -> Option<ContainerOperation> {
        let container = match self.containers.get(&spec.name) {
            Some(container) => container,
            None => return Some(ContainerOperation::Create),
        };

        let spec_hash = hasher::digest(spec);
        let unchanged = container
            .labels
            .get(LABEL_HASH)
            .map(|hash| *hash == spec_hash)
            .unwrap_or(false);

        if !unchanged {
            return Some(ContainerOperation::Recreate);
        }

        match container.status {
            ContainerStatus::Configured => Some(ContainerOperation::Start),
            ContainerStatus::Running => None,
            ContainerStatus::Exited => Some(ContainerOperation::Start),
            ContainerStatus::Unknown => Some(ContainerOperation::Recreate),
        }
    }

    /// Containers labelled with this project that `specs` do not describe.
    pub fn find_orphans(&self, specs: &[ContainerSpec]) -> Vec<ContainerName> {
        let names = specs.iter().map(|spec| &spec.name).collect::<Set<_>>();

        self.containers
            .keys()
            .filter(|name| !names.contains(name))
            .cloned()
            .collect()
    }

    pub fn up(&mut self, spec: ContainerSpec, timeout: u32) -> Result<RunningContainer, LaunchError> {
        let operation = self.plan(&spec);
        info!("{}: {:?}", spec.name.0, operation);

        if let Some(operation) = operation {
            self.container_apply(&spec, operation, timeout)?;
        }

        Ok(self.running(&spec))
    }

    /// Stops and removes the container; it is recreated by the next `up`.
    pub fn stop(&mut self, name: &ContainerName, timeout: u32) -> Result<(), LaunchError> {
        if !self.containers.contains_key(name) {
            info!("{} is not present", name.0);
            return Ok(());
        }

        self.remove(name, timeout)
    }

    pub fn restart(
        &mut self,
        spec: ContainerSpec,
        timeout: u32,
    ) -> Result<RunningContainer, LaunchError> {
        let operation = if self.containers.contains_key(&spec.name) {
            ContainerOperation::Recreate
        } else {
            ContainerOperation::Create
        };
        self.container_apply(&spec, operation, timeout)?;

        Ok(self.running(&spec))
    }

    /// Removes every container of the project, orphans included.
    pub fn down(&mut self, timeout: u32) -> Result<Vec<ContainerName>, LaunchError> {
        let names = self.containers.keys().cloned().collect::<Vec<_>>();
        for name in names.iter() {
            self.remove(name, timeout)?;
        }

        Ok(names)
    }

    fn container_apply(
        &mut self,
        spec: &ContainerSpec,
        operation: ContainerOperation,
        timeout: u32,
    ) -> Result<(), LaunchError> {
        match operation {
            ContainerOperation::Create => {
                let id = self.container_create(spec.clone())?;
                self.container_start(&spec.name, &id)?;
            }
            ContainerOperation::Recreate => {
                self.remove(&spec.name, timeout)?;
                let id = self.container_create(spec.clone())?;
                self.container_start(&spec.name, &id)?;
            }
            ContainerOperation::Start => {
                let id = self.existing(&spec.name)?.id.clone();
                self.container_start(&spec.name, &id)?;
            }
        }

        Ok(())
    }

    fn container_create(&mut self, mut spec: ContainerSpec) -> Result<ContainerId, LaunchError> {
        let hash = hasher::digest(&spec);

        spec.labels
            .insert(LABEL_PROJECT.into(), self.project_name.clone());
        spec.labels.insert(LABEL_HASH.into(), hash);

        let name = spec.name.clone();
        let labels = spec.labels.clone();
        let id = self
            .backend
            .create_container(spec)
            .map_err(|err| backend_error(&name.0, err))?;

        self.containers.insert(
            name.clone(),
            Container {
                id: id.clone(),
                name,
                status: ContainerStatus::Configured,
                exit_code: None,
                labels,
            },
        );

        Ok(id)
    }

    /// Starts the container and checks that its command did not exit already.
    fn container_start(&mut self, name: &ContainerName, id: &ContainerId) -> Result<(), LaunchError> {
        let start_failed = |reason: String| LaunchError::RuntimeStart {
            name: name.0.clone(),
            reason,
        };

        self.backend
            .start_container(&id.0)
            .map_err(|err| start_failed(format!("{:#}", err)))?;

        let container = self
            .backend
            .inspect_container(&id.0)
            .map_err(|err| backend_error(&name.0, err))?
            .ok_or_else(|| start_failed("container vanished after start".into()))?;

        let status = container.status.clone();
        let exit_code = container.exit_code;
        self.containers.insert(name.clone(), container);

        match (status, exit_code) {
            (ContainerStatus::Exited, Some(code)) if code != 0 => {
                Err(start_failed(format!("start command exited with code {}", code)))
            }
            (ContainerStatus::Exited, _) => {
                warn!("{} exited right after starting", name.0);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn remove(&mut self, name: &ContainerName, timeout: u32) -> Result<(), LaunchError> {
        let container = self.existing(name)?.clone();

        if container.status == ContainerStatus::Running {
            self.backend
                .stop_container(&container.id.0, timeout)
                .map_err(|err| backend_error(&name.0, err))?;
        }
        self.backend
            .remove_container(&container.id.0, false)
            .map_err(|err| backend_error(&name.0, err))?;
        self.containers.remove(name);

        Ok(())
    }

    fn existing(&self, name: &ContainerName) -> Result<&Container, LaunchError> {
        self.containers.get(name).ok_or_else(|| LaunchError::Backend {
            name: name.0.clone(),
            reason: "could not find container".into(),
        })
    }

    fn running(&self, spec: &ContainerSpec) -> RunningContainer {
        let id = self
            .containers
            .get(&spec.name)
            .map(|container| container.id.clone())
            .unwrap_or_else(|| ContainerId(spec.name.0.clone()));

        RunningContainer {
            id,
            name: spec.name.clone(),
            image_name: spec.image_name.clone(),
            volumes: spec.volumes.clone(),
            ports: spec.ports.clone(),
        }
    }
}

fn backend_error(name: &str, err: anyhow::Error) -> LaunchError {
    LaunchError::Backend {
        name: name.to_owned(),
        reason: format!("{:#}", err),
    }
}
