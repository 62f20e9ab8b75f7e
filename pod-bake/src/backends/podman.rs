use anyhow::{anyhow, Context, Result};
use ignore::WalkBuilder;
use log::{debug, info, warn};
use number_prefix::NumberPrefix;
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    env,
    ffi::OsString,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tempfile::TempDir;

use crate::{
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, ImageBuildSpec,
        ImageId, ImageMetadata, PortSpec,
    },
    services::ContainerBackend,
};

/// Drives a podman (or docker) compatible engine through its command line.
pub struct PodmanBackend {
    program: OsString,
}

impl PodmanBackend {
    pub fn connect<P: Into<OsString>>(program: P) -> Result<PodmanBackend> {
        let backend = PodmanBackend {
            program: program.into(),
        };
        let version = backend
            .output(&["--version"])
            .with_context(|| format!("could not run container engine {:?}", backend.program))?;
        info!("using {}", version.trim());

        Ok(backend)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null());
        command
    }

    /// Runs the engine and returns its stdout, failing on a non-zero exit.
    fn output<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> Result<String> {
        let output = self.command().args(args).output()?;

        if !output.status.success() {
            let verb = args
                .first()
                .map(|arg| arg.as_ref().to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(EngineError {
                verb,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("engine {verb} exited with {status}: {stderr}")]
struct EngineError {
    verb: String,
    status: String,
    stderr: String,
}

impl EngineError {
    fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_ascii_lowercase();
        stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
    }
}

/// Turns a failed inspect of a missing object into `None`.
fn not_found_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.downcast_ref::<EngineError>() {
            Some(engine_err) if engine_err.is_not_found() => Ok(None),
            _ => Err(err),
        },
    }
}

impl ContainerBackend for PodmanBackend {
    fn image_metadata(&mut self, name: &str) -> Result<Option<ImageMetadata>> {
        let output = not_found_as_none(self.output(&["image", "inspect", name]))?;
        match output {
            Some(output) => metadata_from_inspect(&output),
            None => Ok(None),
        }
    }

    fn build_image(&mut self, spec: ImageBuildSpec) -> Result<ImageId> {
        let temp_dir = TempDir::new()?;
        let containerfile_path = temp_dir.path().join("Containerfile");
        let iidfile_path = temp_dir.path().join("iid");
        {
            let mut options = OpenOptions::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut containerfile = options.write(true).create(true).open(&containerfile_path)?;
            containerfile.write_all(spec.containerfile.as_bytes())?;
        }
        debug!("rendered containerfile:\n{}", spec.containerfile);
        debug!("expecting {:?}", spec.metadata);

        let walk = WalkBuilder::new(&spec.context)
            .add_custom_ignore_filename(".dockerignore")
            .ignore(false)
            .git_global(false)
            .git_ignore(false)
            .git_exclude(false)
            .hidden(false)
            .build();

        let mut context_size = 0;
        for result in walk {
            context_size += result?.metadata()?.len();
        }

        match NumberPrefix::binary(context_size as f32) {
            NumberPrefix::Standalone(bytes) => println!("Build context ({} bytes)", bytes),
            NumberPrefix::Prefixed(prefix, n) => println!("Build context ({:.1} {}B)", n, prefix),
        };

        let status = self
            .command()
            .arg("build")
            .arg("--file")
            .arg(&containerfile_path)
            .arg("--iidfile")
            .arg(&iidfile_path)
            .arg("--tag")
            .arg(&spec.name.0)
            .arg(&spec.context)
            .status()?;

        if !status.success() {
            return Err(anyhow!("engine build of {} exited with {}", spec.name.0, status));
        }

        let image_id = fs::read_to_string(&iidfile_path)
            .context("the engine did not write an image id")?
            .trim()
            .to_owned();
        if image_id.is_empty() {
            return Err(anyhow!("the engine wrote an empty image id"));
        }

        temp_dir.close()?;

        Ok(ImageId(image_id))
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let mut args = vec![
            "ps".to_owned(),
            "--all".to_owned(),
            "--no-trunc".to_owned(),
            "--format".to_owned(),
            "{{.ID}}".to_owned(),
        ];
        for (label, value) in labels.iter() {
            args.push("--filter".to_owned());
            args.push(format!("label={}={}", label, value));
        }

        let mut containers = Map::new();
        for id in self.output(&args)?.lines().map(str::trim) {
            if id.is_empty() {
                continue;
            }
            // The container may disappear between listing and inspecting.
            if let Some(container) = self.inspect_container(id)? {
                containers.insert(container.name.clone(), container);
            }
        }

        Ok(containers)
    }

    fn inspect_container(&mut self, name: &str) -> Result<Option<Container>> {
        let output = not_found_as_none(self.output(&["container", "inspect", name]))?;
        match output {
            Some(output) => container_from_inspect(&output),
            None => Ok(None),
        }
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let mut args: Vec<OsString> = vec!["create".into(), "--init".into()];
        args.push("--name".into());
        args.push(spec.name.0.clone().into());

        for (key, value) in spec.labels.iter() {
            args.push("--label".into());
            args.push(format!("{}={}", key, value).into());
        }

        for port in spec.ports.iter() {
            args.push("--publish".into());
            args.push(port.to_string().into());
        }

        for volume in spec.volumes.iter() {
            let mut mapping = absolute(&volume.host)?.into_os_string();
            mapping.push(":");
            mapping.push(&volume.container);
            args.push("--volume".into());
            args.push(mapping);
        }

        args.push(spec.image_name.0.into());

        let id = self.output(&args)?;
        Ok(ContainerId(id.trim().to_owned()))
    }

    fn start_container(&mut self, name: &str) -> Result<ContainerId> {
        self.output(&["start", name])?;
        Ok(ContainerId(name.to_owned()))
    }

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId> {
        let timeout = timeout.to_string();
        self.output(&["stop", "--time", timeout.as_str(), name])?;
        Ok(ContainerId(name.to_owned()))
    }

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId> {
        if remove_volumes {
            self.output(&["rm", "--volumes", name])?;
        } else {
            self.output(&["rm", name])?;
        }
        Ok(ContainerId(name.to_owned()))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectImage {
    config: Option<InspectImageConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectImageConfig {
    env: Option<Vec<String>>,
    exposed_ports: Option<Map<String, serde_json::Value>>,
    working_dir: Option<String>,
    cmd: Option<Vec<String>>,
    labels: Option<Map<String, String>>,
}

fn metadata_from_inspect(output: &str) -> Result<Option<ImageMetadata>> {
    let images: Vec<InspectImage> = serde_json::from_str(output)?;
    let image = match images.into_iter().next() {
        Some(image) => image,
        None => return Ok(None),
    };
    let config = image.config.unwrap_or_default();

    let env = config
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|entry| match entry.find('=') {
            Some(split_index) => (entry[..split_index].to_owned(), entry[split_index + 1..].to_owned()),
            None => (entry, String::new()),
        })
        .collect();

    let exposed_ports = config
        .exposed_ports
        .unwrap_or_default()
        .keys()
        .filter_map(|port| match port.parse::<PortSpec>() {
            Ok(port) => Some(port),
            Err(err) => {
                warn!("ignoring exposed port {:?}: {}", port, err);
                None
            }
        })
        .collect();

    Ok(Some(ImageMetadata {
        env,
        exposed_ports,
        working_dir: PathBuf::from(config.working_dir.unwrap_or_default()),
        cmd: config.cmd.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    state: InspectContainerState,
    config: Option<InspectContainerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainerState {
    status: String,
    exit_code: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainerConfig {
    labels: Option<Map<String, String>>,
}

fn container_from_inspect(output: &str) -> Result<Option<Container>> {
    let containers: Vec<InspectContainer> = serde_json::from_str(output)?;
    let container = match containers.into_iter().next() {
        Some(container) => container,
        None => return Ok(None),
    };

    let status = ContainerStatus::parse(&container.state.status);
    if status == ContainerStatus::Unknown {
        warn!("unknown container status: {:?}", container.state.status);
    }

    let exit_code = match status {
        ContainerStatus::Exited => container.state.exit_code,
        _ => None,
    };

    Ok(Some(Container {
        id: ContainerId(container.id),
        name: ContainerName(container.name.trim_start_matches('/').to_owned()),
        status,
        exit_code,
        labels: container
            .config
            .unwrap_or_default()
            .labels
            .unwrap_or_default(),
    }))
}
