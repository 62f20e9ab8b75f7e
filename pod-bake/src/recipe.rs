use log::debug;
use std::{collections::BTreeMap as Map, fmt::Write as _};

use crate::{
    error::{BuildError, BuildStep},
    models::{BuildSpec, CacheKey, ImageMetadata},
};

pub const LABEL_CACHE_KEY: &str = "io.pod-bake.cache-key";
pub const LABEL_SOURCE: &str = "io.pod-bake.source";
pub const LABEL_TAG: &str = "io.pod-bake.tag";

/// Directory inside the build context holding the fetched source.
pub const CHECKOUT_DIR: &str = "checkout";

const SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// A rendered Containerfile and the configuration it declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipe {
    pub containerfile: String,
    pub metadata: ImageMetadata,
}

/// Collapses the ordered env list, the last value of a key wins.
pub fn resolve_env(env: &[(String, String)]) -> Map<String, String> {
    env.iter().cloned().collect()
}

pub fn labels(spec: &BuildSpec, cache_key: &CacheKey) -> Map<String, String> {
    let mut labels = Map::new();
    labels.insert(LABEL_CACHE_KEY.to_owned(), cache_key.0.clone());
    labels.insert(LABEL_SOURCE.to_owned(), spec.source_url.clone());
    labels.insert(LABEL_TAG.to_owned(), spec.tag.clone());
    labels
}

pub fn declared_metadata(spec: &BuildSpec, cache_key: &CacheKey) -> ImageMetadata {
    let mut cmd = SHELL.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    cmd.push(spec.start_command.clone());

    ImageMetadata {
        env: resolve_env(&spec.env),
        exposed_ports: vec![spec.exposed_port],
        working_dir: spec.workdir.clone(),
        cmd,
        labels: labels(spec, cache_key),
    }
}

/// Renders the Containerfile for an already validated spec.
pub fn render(spec: &BuildSpec, cache_key: &CacheKey) -> Result<Recipe, BuildError> {
    let metadata = declared_metadata(spec, cache_key);
    let declare_failed = |reason: String| BuildError::Image {
        step: BuildStep::Declare,
        reason,
    };

    let workdir = spec
        .workdir
        .to_str()
        .ok_or_else(|| declare_failed(format!("{:?} is not valid UTF-8", spec.workdir)))?;
    let copy = [
        format!("{}/", CHECKOUT_DIR),
        format!("{}/", workdir.trim_end_matches('/')),
    ];
    let copy = serde_json::to_string(&copy).map_err(|err| declare_failed(err.to_string()))?;
    let cmd = serde_json::to_string(&metadata.cmd).map_err(|err| declare_failed(err.to_string()))?;

    let mut containerfile = String::new();
    // Writing into a String does not fail.
    let _ = writeln!(containerfile, "FROM {}", spec.base_image);

    for (key, value) in metadata.labels.iter() {
        let _ = writeln!(containerfile, "LABEL {}={}", quote(key), quote(value));
    }

    let _ = writeln!(containerfile, "WORKDIR {}", workdir);
    let _ = writeln!(containerfile, "COPY {}", copy);

    debug!("configuring {} environment variables", metadata.env.len());
    for (key, value) in metadata.env.iter() {
        let _ = writeln!(containerfile, "ENV {}={}", key, quote(value));
    }

    for port in metadata.exposed_ports.iter() {
        let _ = writeln!(containerfile, "EXPOSE {}", port);
    }

    let _ = writeln!(containerfile, "CMD {}", cmd);

    Ok(Recipe {
        containerfile,
        metadata,
    })
}

/// Double quotes a value so the Containerfile parser hands it back verbatim.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
