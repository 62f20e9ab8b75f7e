use anyhow::{anyhow, Result};
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, warn};
use std::{
    env,
    io::{stderr, stdout, Write},
    path::PathBuf,
    process,
    time::Duration,
};
use structopt::StructOpt;

use backends::PodmanBackend;
use builder::Builder;
use error::{BuildError, LaunchError};
use fetch::{FetchCache, GitFetcher};
use frontends::{find_recipe_file, RecipeFileFrontend};
use launcher::Launcher;
use models::{BuildSpec, ContainerSpec, Image, ImageMetadata, Project, RunSettings};
use recipe::LABEL_CACHE_KEY;
use services::{ContainerBackend, RecipeFrontend};

mod backends;
mod builder;
mod error;
#[cfg(test)]
mod fakes;
mod fetch;
mod frontends;
mod hasher;
mod launcher;
mod models;
mod recipe;
mod services;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pod-bake",
    about = "Builds images from a pinned source checkout and runs them with podman."
)]
struct Opt {
    /// Container engine executable, podman or docker.
    #[structopt(long, env = "POD_BAKE_ENGINE", default_value = "podman")]
    engine: String,

    /// Where fetched sources are kept, one directory per cache key.
    #[structopt(long, env = "POD_BAKE_CACHE_DIR", parse(from_os_str))]
    cache_dir: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
struct BuildArgs {
    #[structopt(long, env = "BASE_IMAGE")]
    base_image: Option<String>,

    /// Version tag of the source to fetch, floating references are rejected.
    #[structopt(long, env = "TAG")]
    tag: Option<String>,

    #[structopt(long, env = "SOURCE_URL")]
    source_url: Option<String>,

    /// Seconds before the source fetch is abandoned.
    #[structopt(long)]
    fetch_timeout: Option<u64>,
}

impl BuildArgs {
    fn apply(self, spec: &mut BuildSpec) {
        if let Some(base_image) = self.base_image {
            spec.base_image = base_image;
        }
        if let Some(tag) = self.tag {
            spec.tag = tag;
        }
        if let Some(source_url) = self.source_url {
            spec.source_url = source_url;
        }
        if let Some(fetch_timeout) = self.fetch_timeout {
            spec.fetch_timeout = Some(Duration::from_secs(fetch_timeout));
        }
    }
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Fetches the pinned source and builds the image described by pod-bake.yml.
    Build {
        #[structopt(flatten)]
        args: BuildArgs,
    },
    /// Prints the key that decides whether the source fetch is reused.
    CacheKey {
        #[structopt(flatten)]
        args: BuildArgs,
    },
    /// Shows what the built image declares.
    Inspect,
    /// Starts the container, building the image first if it is missing or
    /// was built from another tag.
    Up {
        #[structopt(long)]
        /// Build the image even if it already exists.
        build: bool,

        #[structopt(flatten)]
        args: BuildArgs,

        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    /// Stops and removes the container.
    Stop {
        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
    Restart {
        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
    /// Stops and removes every container of the project.
    Down {
        #[structopt(long, default_value = "5")]
        timeout: u32,
    },
}

/// Problems locating or reading pod-bake.yml.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct RecipeError(String);

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    if let Err(err) = run(opt) {
        let mut stderr = stderr();
        let _ = stderr
            .queue(style::PrintStyledContent("ERROR: ".red().bold()))
            .and_then(|stderr| stderr.queue(style::Print(format!("{:#}\n", err))))
            .map(|stderr| stderr.flush());

        process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<BuildError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<LaunchError>() {
            return err.exit_code();
        }
        if cause.downcast_ref::<RecipeError>().is_some() {
            return 2;
        }
    }

    1
}

fn load_project() -> Result<Project> {
    let current_dir = env::current_dir()?;
    let recipe_file_path = find_recipe_file(current_dir).ok_or_else(|| {
        RecipeError("Couldn't find a pod-bake.yml file in the current working directory or any of its parents.".into())
    })?;
    info!("found recipe file {:?}", recipe_file_path);

    let work_directory = recipe_file_path
        .parent()
        .ok_or_else(|| RecipeError("Recipe file has no parent.".into()))?;
    info!("found work directory {:?}", work_directory);

    env::set_current_dir(work_directory)?;

    let project_name = work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .ok_or_else(|| RecipeError("Couldn't determine the project name.".into()))?;
    info!("project name {:?}", project_name);

    let mut frontend = RecipeFileFrontend::new();
    let project = frontend
        .project(project_name, &recipe_file_path)
        .map_err(|err| RecipeError(format!("{:#}", err)))?;
    info!("parsed recipe");

    Ok(project)
}

fn run(opt: Opt) -> Result<()> {
    let mut project = load_project()?;
    let mut stdout = stdout();

    let cache_root = opt.cache_dir.unwrap_or_else(FetchCache::default_root);
    let engine = opt.engine;

    match opt.command {
        Command::CacheKey { args } => {
            args.apply(&mut project.build);
            builder::validate(&project.build)?;
            println!("{}", Builder::cache_key(&project.build));
        }
        Command::Build { args } => {
            args.apply(&mut project.build);
            let mut backend = PodmanBackend::connect(engine)?;
            let image = build(&mut backend, cache_root, &project.build)?;
            print_image(&mut stdout, &image)?;
        }
        Command::Inspect => {
            let mut backend = PodmanBackend::connect(engine)?;
            let name = &project.build.image_name.0;
            let metadata = backend
                .image_metadata(name)?
                .ok_or_else(|| anyhow!("image {} has not been built", name))?;
            print_metadata(&mut stdout, &metadata)?;
        }
        Command::Up {
            build: force_build,
            args,
            timeout,
            remove_orphans,
        } => {
            args.apply(&mut project.build);
            let mut backend = PodmanBackend::connect(engine)?;

            let metadata = match builder::current_image(&mut backend, &project.build)? {
                Some(metadata) if !force_build => metadata,
                _ => build(&mut backend, cache_root, &project.build)?.metadata,
            };
            check_config_file(&project.run);

            let mut launcher = Launcher::init(project.name.clone(), backend)?;
            let spec = container_spec(&launcher, &project, &metadata);
            check_orphans(&mut launcher, &mut stdout, &spec, remove_orphans, timeout)?;

            status(&mut stdout, "Starting", &spec.name.0)?;
            let running = launcher.up(spec, timeout)?;
            done(&mut stdout)?;

            println!("{} ({}) runs {}", running.name.0, running.id.0, running.image_name.0);
            for volume in running.volumes.iter() {
                println!("  volume     {}:{}", volume.host.display(), volume.container.display());
            }
            for port in running.ports.iter() {
                println!("  publish    {}", port);
            }
        }
        Command::Stop { timeout } => {
            let backend = PodmanBackend::connect(engine)?;
            let mut launcher = Launcher::init(project.name.clone(), backend)?;

            status(&mut stdout, "Stopping", &project.run.container_name.0)?;
            launcher.stop(&project.run.container_name, timeout)?;
            done(&mut stdout)?;
        }
        Command::Restart { timeout } => {
            let mut backend = PodmanBackend::connect(engine)?;
            let name = &project.build.image_name.0;
            let metadata = backend
                .image_metadata(name)?
                .ok_or_else(|| anyhow!("image {} has not been built", name))?;
            check_config_file(&project.run);

            let mut launcher = Launcher::init(project.name.clone(), backend)?;
            let spec = container_spec(&launcher, &project, &metadata);

            status(&mut stdout, "Restarting", &spec.name.0)?;
            launcher.restart(spec, timeout)?;
            done(&mut stdout)?;
        }
        Command::Down { timeout } => {
            let backend = PodmanBackend::connect(engine)?;
            let mut launcher = Launcher::init(project.name.clone(), backend)?;

            for name in launcher.down(timeout)? {
                println!("Removed {}", name.0);
            }
        }
    }

    Ok(())
}

fn build(backend: &mut PodmanBackend, cache_root: PathBuf, spec: &BuildSpec) -> Result<Image> {
    let mut fetcher = GitFetcher::new();
    let mut builder = Builder::new(&mut fetcher, backend, FetchCache::new(cache_root));

    let image = builder.build(spec).map_err(|err| {
        warn!("build of {} stopped at the {} step", spec.image_name.0, err.step());
        err
    })?;

    Ok(image)
}

/// The image's cache key is part of the spec, so a rebuilt tag recreates the container.
fn container_spec(launcher: &Launcher, project: &Project, metadata: &ImageMetadata) -> ContainerSpec {
    let mut spec = launcher.container_spec(&project.build.image_name, &project.run);
    if let Some(cache_key) = metadata.labels.get(LABEL_CACHE_KEY) {
        spec.labels.insert(LABEL_CACHE_KEY.into(), cache_key.clone());
    }
    spec
}

fn check_config_file(run: &RunSettings) {
    let (config_file, volume) = match (&run.config_file, run.volumes.first()) {
        (Some(config_file), Some(volume)) => (config_file, volume),
        _ => return,
    };

    let path = volume.host.join(config_file);
    if !path.is_file() {
        warn!(
            "{:?} does not exist, the container expects it at {:?}",
            path,
            volume.container.join(config_file)
        );
    }
}

/// Looks for orphans, if there are any and `remove_orphans` is set to true
/// they will be removed. Otherwise a message will be printed.
fn check_orphans(
    launcher: &mut Launcher,
    stdout: &mut impl Write,
    spec: &ContainerSpec,
    remove_orphans: bool,
    timeout: u32,
) -> Result<()> {
    let orphans = launcher.find_orphans(std::slice::from_ref(spec));

    if orphans.is_empty() {
        info!("found no orphans");
    } else if remove_orphans {
        for name in orphans {
            status(stdout, "Removing", &name.0)?;
            launcher.stop(&name, timeout)?;
            done(stdout)?;
        }
    } else {
        stdout
            .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
            .queue(style::Print(
                "found orphans, rerun with --remove-orphans to remove them.\n",
            ))?
            .flush()?;
    }

    Ok(())
}

fn status(stdout: &mut impl Write, verb: &str, name: &str) -> Result<()> {
    stdout
        .queue(style::Print(format!("{} {} ... ", verb, name)))?
        .flush()?;
    Ok(())
}

fn done(stdout: &mut impl Write) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("done".green().bold()))?
        .queue(style::Print("\n"))?
        .flush()?;
    Ok(())
}

fn print_image(stdout: &mut impl Write, image: &Image) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("Built ".green().bold()))?
        .queue(style::Print(format!("{} ({})\n", image.name.0, image.id.0)))?
        .queue(style::Print(format!("  cache key  {}\n", image.cache_key)))?;

    print_metadata(stdout, &image.metadata)
}

fn print_metadata(stdout: &mut impl Write, metadata: &ImageMetadata) -> Result<()> {
    let ports = metadata
        .exposed_ports
        .iter()
        .map(|port| port.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    stdout
        .queue(style::Print(format!("  workdir    {}\n", metadata.working_dir.display())))?
        .queue(style::Print(format!("  expose     {}\n", ports)))?
        .queue(style::Print(format!("  command    {:?}\n", metadata.cmd)))?;

    for (key, value) in metadata.env.iter() {
        stdout.queue(style::Print(format!("  env        {}={}\n", key, value)))?;
    }

    stdout.flush()?;
    Ok(())
}
