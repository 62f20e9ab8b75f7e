use log::info;
use std::path::Component;

use crate::{
    error::{BuildError, BuildStep},
    fetch::FetchCache,
    hasher,
    models::{BuildSpec, CacheKey, Image, ImageBuildSpec, ImageMetadata},
    recipe::{self, LABEL_CACHE_KEY},
    services::{ContainerBackend, SourceFetcher},
};

/// References that move over time and can not pin a build.
const FLOATING_REFS: &[&str] = &["latest", "HEAD"];

/// Produces derived images: validate, fetch, configure, declare, commit.
pub struct Builder<'a> {
    fetcher: &'a mut dyn SourceFetcher,
    backend: &'a mut dyn ContainerBackend,
    cache: FetchCache,
}

impl<'a> Builder<'a> {
    pub fn new(
        fetcher: &'a mut dyn SourceFetcher,
        backend: &'a mut dyn ContainerBackend,
        cache: FetchCache,
    ) -> Builder<'a> {
        Builder {
            fetcher,
            backend,
            cache,
        }
    }

    /// The key guarding the fetch step of `spec`.
    pub fn cache_key(spec: &BuildSpec) -> CacheKey {
        hasher::cache_key(&spec.source_url, &spec.tag)
    }

    pub fn build(&mut self, spec: &BuildSpec) -> Result<Image, BuildError> {
        info!("{}: {}", BuildStep::Validate, spec.image_name.0);
        validate(spec)?;
        let cache_key = Builder::cache_key(spec);

        info!("{}: {} at {}", BuildStep::Fetch, spec.source_url, spec.tag);
        let entry = self.cache.ensure(&mut *self.fetcher, spec, &cache_key)?;

        info!("{}: {} environment entries", BuildStep::Configure, spec.env.len());
        info!(
            "{}: port {}, working directory {:?}",
            BuildStep::Declare,
            spec.exposed_port,
            spec.workdir
        );
        let recipe = recipe::render(spec, &cache_key)?;

        info!("{}: building {} from {}", BuildStep::Commit, spec.image_name.0, spec.base_image);
        let commit_failed = |err: anyhow::Error| BuildError::Image {
            step: BuildStep::Commit,
            reason: format!("{:#}", err),
        };

        let id = self
            .backend
            .build_image(ImageBuildSpec {
                name: spec.image_name.clone(),
                context: entry.path,
                containerfile: recipe.containerfile,
                metadata: recipe.metadata,
            })
            .map_err(commit_failed)?;

        let metadata = self
            .backend
            .image_metadata(&id.0)
            .map_err(commit_failed)?
            .ok_or_else(|| BuildError::Image {
                step: BuildStep::Commit,
                reason: format!("built image {} could not be inspected", id.0),
            })?;

        info!("built {} as {}", spec.image_name.0, id.0);

        Ok(Image {
            id,
            name: spec.image_name.clone(),
            cache_key,
            metadata,
        })
    }
}

/// Metadata of the image named by `spec` when it was built from the same
/// pinned source, `None` when it is missing or was built from another tag.
pub fn current_image(
    backend: &mut dyn ContainerBackend,
    spec: &BuildSpec,
) -> anyhow::Result<Option<ImageMetadata>> {
    let cache_key = Builder::cache_key(spec);
    let metadata = match backend.image_metadata(&spec.image_name.0)? {
        Some(metadata) => metadata,
        None => return Ok(None),
    };

    if metadata.labels.get(LABEL_CACHE_KEY) != Some(&cache_key.0) {
        info!(
            "{} was not built from {} at {}",
            spec.image_name.0, spec.source_url, spec.tag
        );
        return Ok(None);
    }

    Ok(Some(metadata))
}

fn splits_line(c: char) -> bool {
    c == '\n' || c == '\r' || c == '\0'
}

fn is_variable_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => (),
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

pub fn validate(spec: &BuildSpec) -> Result<(), BuildError> {
    let required = [
        ("image_name", spec.image_name.0.as_str()),
        ("base_image", spec.base_image.as_str()),
        ("source_url", spec.source_url.as_str()),
        ("tag", spec.tag.as_str()),
        ("start_command", spec.start_command.as_str()),
    ];
    for &(parameter, value) in required.iter() {
        if value.trim().is_empty() {
            return Err(BuildError::config(parameter, "must not be empty"));
        }
    }

    let references = [
        ("image_name", spec.image_name.0.as_str()),
        ("base_image", spec.base_image.as_str()),
        ("tag", spec.tag.as_str()),
    ];
    for &(parameter, value) in references.iter() {
        if value.chars().any(|c| c.is_whitespace() || c == '\0') {
            return Err(BuildError::config(parameter, "must not contain whitespace"));
        }
    }
    if FLOATING_REFS.contains(&spec.tag.as_str()) || spec.tag.starts_with("refs/heads/") {
        return Err(BuildError::config(
            "tag",
            format!("{:?} is a floating reference, pin a version tag", spec.tag),
        ));
    }

    let workdir = spec.workdir.to_str().ok_or_else(|| {
        BuildError::config("workdir", format!("{:?} is not valid UTF-8", spec.workdir))
    })?;
    if workdir.contains(splits_line) {
        return Err(BuildError::config(
            "workdir",
            format!("{:?} must be a single line", spec.workdir),
        ));
    }
    if !spec.workdir.is_absolute() {
        return Err(BuildError::config(
            "workdir",
            format!("{:?} must be an absolute path", spec.workdir),
        ));
    }
    if spec
        .workdir
        .components()
        .any(|component| component == Component::ParentDir)
    {
        return Err(BuildError::config(
            "workdir",
            format!("{:?} must not contain `..`", spec.workdir),
        ));
    }

    for (key, value) in spec.env.iter() {
        if !is_variable_name(key) {
            return Err(BuildError::config(
                "env",
                format!("{:?} is not a valid variable name", key),
            ));
        }
        if value.contains(splits_line) {
            return Err(BuildError::config(
                "env",
                format!("value of {} must be a single line", key),
            ));
        }
    }

    if spec.exposed_port.port == 0 {
        return Err(BuildError::config("exposed_port", "port 0 can not be exposed"));
    }

    Ok(())
}
