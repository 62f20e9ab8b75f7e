use std::{
    collections::BTreeMap as Map,
    fmt,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::error::BuildError;

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

/// Hex encoded blake3 digest identifying one pinned fetch of a source.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct CacheKey(pub String);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> PortSpec {
        PortSpec {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = BuildError;

    /// Parses `5006`, `5006/tcp` or `5006/udp`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BuildError::config("exposed_port", format!("{:?}: {}", value, reason));

        let mut parts = value.trim().splitn(2, '/');
        let port = parts.next().unwrap_or_default();
        let port: u16 = port.parse().map_err(|_| invalid("not a port number"))?;

        let protocol = match parts.next().map(|p| p.to_ascii_lowercase()) {
            None => Protocol::Tcp,
            Some(ref p) if p == "tcp" => Protocol::Tcp,
            Some(ref p) if p == "udp" => Protocol::Udp,
            Some(_) => return Err(invalid("protocol must be tcp or udp")),
        };

        Ok(PortSpec { port, protocol })
    }
}

/// Everything needed to produce one derived image. Built once per build
/// invocation and never modified afterwards.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BuildSpec {
    pub image_name: ImageName,
    pub base_image: String,
    pub source_url: String,
    pub tag: String,
    pub workdir: PathBuf,
    /// Applied in order, later entries win on key collision.
    pub env: Vec<(String, String)>,
    pub exposed_port: PortSpec,
    pub start_command: String,
    pub fetch_timeout: Option<Duration>,
}

/// The configuration an image declares, as reported by the container runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub env: Map<String, String>,
    pub exposed_ports: Vec<PortSpec>,
    pub working_dir: PathBuf,
    pub cmd: Vec<String>,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub id: ImageId,
    pub name: ImageName,
    pub cache_key: CacheKey,
    pub metadata: ImageMetadata,
}

/// Input for the backend: a rendered Containerfile along with the build
/// context it refers to.
#[derive(Clone, Debug)]
pub struct ImageBuildSpec {
    pub name: ImageName,
    pub context: PathBuf,
    pub containerfile: String,
    pub metadata: ImageMetadata,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: PathBuf,
}

impl FromStr for VolumeMount {
    type Err = BuildError;

    /// Parses `host:container`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let split_index = value
            .rfind(':')
            .ok_or_else(|| BuildError::config("volume", format!("{:?}: expected host:container", value)))?;
        let (host, container) = value.split_at(split_index);
        let container = &container[1..];

        if host.is_empty() || !container.starts_with('/') {
            return Err(BuildError::config(
                "volume",
                format!("{:?}: expected host:/absolute/container/path", value),
            ));
        }

        Ok(VolumeMount {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
        })
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: PortSpec,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl FromStr for PortBinding {
    type Err = BuildError;

    /// Parses `5006`, `8080:5006` or `8080:5006/tcp`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.find(':') {
            Some(split_index) => {
                let (host, container) = value.split_at(split_index);
                let host = host.parse().map_err(|_| {
                    BuildError::config("publish", format!("{:?}: invalid host port", value))
                })?;
                let container = container[1..].parse()?;
                Ok(PortBinding { host, container })
            }
            None => {
                let container: PortSpec = value.parse()?;
                Ok(PortBinding {
                    host: container.port,
                    container,
                })
            }
        }
    }
}

#[derive(Clone, Debug, Hash)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image_name: ImageName,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortBinding>,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Configured,
    Running,
    Exited,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> ContainerStatus {
        match status {
            "configured" | "created" => ContainerStatus::Configured,
            "running" => ContainerStatus::Running,
            "exited" | "stopped" => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// How the built image is launched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSettings {
    pub container_name: ContainerName,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortBinding>,
    /// Relative to the host side of the first volume.
    pub config_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Project {
    pub name: String,
    pub build: BuildSpec,
    pub run: RunSettings,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: ContainerId,
    pub name: ContainerName,
    pub image_name: ImageName,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_tcp() {
        assert_eq!("5006".parse::<PortSpec>().unwrap(), PortSpec::tcp(5006));
        assert_eq!("5006/TCP".parse::<PortSpec>().unwrap(), PortSpec::tcp(5006));
    }

    #[test]
    fn port_display_matches_engine_format() {
        let port: PortSpec = "53/udp".parse().unwrap();
        assert_eq!(port.protocol, Protocol::Udp);
        assert_eq!(port.to_string(), "53/udp");
    }

    #[test]
    fn port_rejects_garbage() {
        assert!("http".parse::<PortSpec>().is_err());
        assert!("70000/tcp".parse::<PortSpec>().is_err());
        assert!("80/sctp".parse::<PortSpec>().is_err());
    }

    #[test]
    fn port_binding_forms() {
        let same: PortBinding = "5006".parse().unwrap();
        assert_eq!(same.host, 5006);
        assert_eq!(same.container, PortSpec::tcp(5006));

        let mapped: PortBinding = "8080:5006/tcp".parse().unwrap();
        assert_eq!(mapped.host, 8080);
        assert_eq!(mapped.to_string(), "8080:5006/tcp");
    }

    #[test]
    fn volume_mount_needs_absolute_container_path() {
        let mount: VolumeMount = "./data:/data".parse().unwrap();
        assert_eq!(mount.host, PathBuf::from("./data"));
        assert_eq!(mount.container, PathBuf::from("/data"));

        assert!("./data:data".parse::<VolumeMount>().is_err());
        assert!("/data".parse::<VolumeMount>().is_err());
    }

    #[test]
    fn container_status_names() {
        assert_eq!(ContainerStatus::parse("created"), ContainerStatus::Configured);
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("paused"), ContainerStatus::Unknown);
    }
}
