use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path, time::Duration};

use crate::{
    error::BuildError,
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ImageBuildSpec, ImageId,
        ImageMetadata, Project,
    },
};

pub trait RecipeFrontend {
    fn project<P: AsRef<Path>>(&mut self, project_name: &str, recipe_file_path: P)
        -> Result<Project>;
}

pub struct FetchRequest<'a> {
    pub source_url: &'a str,
    pub tag: &'a str,
    pub destination: &'a Path,
    pub timeout: Option<Duration>,
}

/// Retrieves a shallow copy of a version-controlled source at one tag.
pub trait SourceFetcher {
    fn fetch(&mut self, request: &FetchRequest) -> Result<(), BuildError>;
}

pub trait ContainerBackend {
    /// Returns `None` when no image with this name or id exists.
    fn image_metadata(&mut self, name: &str) -> Result<Option<ImageMetadata>>;

    fn build_image(&mut self, image_spec: ImageBuildSpec) -> Result<ImageId>;

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>>;

    fn inspect_container(&mut self, name: &str) -> Result<Option<Container>>;

    fn create_container(&mut self, container_spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, name: &str) -> Result<ContainerId>;

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId>;

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId>;
}
