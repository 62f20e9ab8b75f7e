use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap as Map,
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    models::{
        BuildSpec, ContainerName, ImageName, PortBinding, PortSpec, Project, RunSettings,
        VolumeMount,
    },
    services::RecipeFrontend,
};

pub const RECIPE_FILE_NAMES: &[&str] = &["pod-bake.yml", "pod-bake.yaml"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    pub image: Option<String>,

    pub base_image: Option<String>,

    pub source_url: Option<String>,

    pub tag: Option<String>,

    pub workdir: String,

    #[serde(default)]
    pub env: MapList,

    pub expose: Port,

    pub command: String,

    /// Seconds.
    pub fetch_timeout: Option<u64>,

    #[serde(default)]
    pub run: Run,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Run {
    pub container_name: Option<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub ports: Vec<String>,

    pub config_file: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Port {
    Number(u16),
    Text(String),
}

impl Port {
    fn as_text(&self) -> String {
        match self {
            Port::Number(port) => port.to_string(),
            Port::Text(port) => port.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::List(Vec::new())
    }
}

impl MapList {
    /// Keeps list order, a map is taken in key order.
    pub fn to_pairs(self) -> Vec<(String, String)> {
        match self {
            MapList::Map(map) => map.into_iter().collect(),
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        let split_index = value.find('=');
        match split_index {
            Some(split_index) => {
                let (key, value) = value.split_at(split_index);
                (key.into(), value[1..].into())
            }
            None => (value, "".into()),
        }
    }
}

pub fn find_recipe_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for file_name in RECIPE_FILE_NAMES {
            let recipe_file_path = path.join(file_name);
            if recipe_file_path.exists() {
                return Some(recipe_file_path);
            }
        }
    }

    None
}

pub struct RecipeFileFrontend;

impl RecipeFileFrontend {
    pub fn new() -> RecipeFileFrontend {
        RecipeFileFrontend
    }

    fn parse(&self, project_name: &str, file: RecipeFile) -> Result<Project> {
        let image_name = ImageName(file.image.unwrap_or_else(|| project_name.to_owned()));

        let exposed_port: PortSpec = file.expose.as_text().parse()?;

        let build = BuildSpec {
            image_name: image_name.clone(),
            base_image: file.base_image.unwrap_or_default(),
            source_url: file.source_url.unwrap_or_default(),
            tag: file.tag.unwrap_or_default(),
            workdir: PathBuf::from(file.workdir),
            env: file.env.to_pairs(),
            exposed_port,
            start_command: file.command,
            fetch_timeout: file.fetch_timeout.map(Duration::from_secs),
        };

        let volumes = file
            .run
            .volumes
            .iter()
            .map(|volume| volume.parse::<VolumeMount>())
            .collect::<Result<Vec<_>, _>>()?;

        let ports = if file.run.ports.is_empty() {
            vec![PortBinding {
                host: exposed_port.port,
                container: exposed_port,
            }]
        } else {
            file.run
                .ports
                .iter()
                .map(|port| port.parse::<PortBinding>())
                .collect::<Result<Vec<_>, _>>()?
        };

        let container_name = file
            .run
            .container_name
            .unwrap_or_else(|| format!("{}_0", project_name));

        let run = RunSettings {
            container_name: ContainerName(container_name),
            volumes,
            ports,
            config_file: file.run.config_file.map(PathBuf::from),
        };

        Ok(Project {
            name: project_name.to_owned(),
            build,
            run,
        })
    }
}

impl RecipeFrontend for RecipeFileFrontend {
    fn project<P: AsRef<Path>>(&mut self, project_name: &str, recipe_file_path: P) -> Result<Project> {
        let recipe_file_path = recipe_file_path.as_ref();
        let recipe_file = File::open(recipe_file_path)
            .with_context(|| format!("could not open {:?}", recipe_file_path))?;

        let file: RecipeFile = serde_yaml::from_reader(recipe_file)
            .with_context(|| format!("could not parse {:?}", recipe_file_path))?;

        self.parse(project_name, file)
            .map_err(|err| anyhow!("{:?}: {}", recipe_file_path, err))
    }
}
