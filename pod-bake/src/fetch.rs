use log::{debug, info, warn};
use std::{
    env,
    ffi::OsString,
    fs,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{BuildError, BuildStep},
    models::{BuildSpec, CacheKey},
    recipe::CHECKOUT_DIR,
    services::{FetchRequest, SourceFetcher},
};

const COMPLETE_MARKER: &str = ".pod-bake-fetched";

/// Shallow, single branch `git clone` of one tag.
pub struct GitFetcher {
    program: OsString,
    leading_args: Vec<OsString>,
    poll_interval: Duration,
}

impl GitFetcher {
    pub fn new() -> GitFetcher {
        GitFetcher::with_command("git", Vec::<OsString>::new())
    }

    /// Runs `program leading_args.. clone ..` instead of `git clone ..`.
    pub fn with_command<P, A, I>(program: P, leading_args: I) -> GitFetcher
    where
        P: Into<OsString>,
        A: Into<OsString>,
        I: IntoIterator<Item = A>,
    {
        GitFetcher {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&mut self, request: &FetchRequest) -> Result<(), BuildError> {
        let failed = |reason: String| BuildError::Fetch {
            url: request.source_url.to_owned(),
            tag: request.tag.to_owned(),
            reason,
        };

        // A file instead of a pipe, nothing reads it until the clone exits.
        let (mut output, sink) = tempfile::tempfile()
            .and_then(|file| file.try_clone().map(|sink| (file, sink)))
            .map_err(|err| failed(format!("could not capture clone output: {}", err)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(&["clone", "--quiet", "--depth", "1", "--single-branch", "--branch"])
            .arg(request.tag)
            .arg("--")
            .arg(request.source_url)
            .arg(request.destination)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(sink));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group, so a timeout also reaches the remote helpers.
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|err| failed(format!("could not run {:?}: {}", self.program, err)))?;

        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => (),
                Err(err) => return Err(failed(err.to_string())),
            }

            if let (Some(deadline), Some(timeout)) = (deadline, request.timeout) {
                if Instant::now() >= deadline {
                    kill_clone(&mut child);
                    return Err(BuildError::FetchTimeout {
                        url: request.source_url.to_owned(),
                        tag: request.tag.to_owned(),
                        timeout,
                    });
                }
            }

            thread::sleep(self.poll_interval);
        };

        if status.success() {
            return Ok(());
        }

        let mut stderr = Vec::new();
        let _ = output
            .seek(SeekFrom::Start(0))
            .and_then(|_| output.read_to_end(&mut stderr));
        let stderr = String::from_utf8_lossy(&stderr);
        let stderr = stderr.trim();

        let reason = if stderr.is_empty() {
            format!("clone exited with {}", status)
        } else {
            stderr.to_owned()
        };

        Err(failed(reason))
    }
}

fn kill_clone(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let _ = Command::new("kill")
            .args(&["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    /// False when a completed earlier fetch was reused.
    pub fetched: bool,
}

/// Completed fetches on disk, one directory per cache key.
pub struct FetchCache {
    root: PathBuf,
}

impl FetchCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> FetchCache {
        FetchCache { root: root.into() }
    }

    /// `$XDG_CACHE_HOME/pod-bake`, falling back to `~/.cache/pod-bake`.
    pub fn default_root() -> PathBuf {
        let base = env::var_os("XDG_CACHE_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| Path::new(&home).join(".cache")))
            .unwrap_or_else(env::temp_dir);

        base.join("pod-bake")
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.0)
    }

    pub fn is_complete(&self, key: &CacheKey) -> bool {
        self.entry_path(key).join(COMPLETE_MARKER).is_file()
    }

    /// Returns the build context for `key`, fetching the source unless a
    /// completed entry already exists. An entry left behind by a failed fetch
    /// is discarded first; a failure during this fetch is left on disk.
    pub fn ensure(
        &self,
        fetcher: &mut dyn SourceFetcher,
        spec: &BuildSpec,
        key: &CacheKey,
    ) -> Result<CacheEntry, BuildError> {
        let io_failed = |source| BuildError::Io {
            step: BuildStep::Fetch,
            source,
        };
        let path = self.entry_path(key);

        if self.is_complete(key) {
            info!("reusing fetch of {} at {} ({})", spec.source_url, spec.tag, key);
            return Ok(CacheEntry {
                key: key.clone(),
                path,
                fetched: false,
            });
        }

        if path.exists() {
            warn!("discarding incomplete fetch in {:?}", path);
            fs::remove_dir_all(&path).map_err(io_failed)?;
        }
        fs::create_dir_all(&path).map_err(io_failed)?;

        let destination = path.join(CHECKOUT_DIR);
        info!("fetching {} at {}", spec.source_url, spec.tag);
        fetcher.fetch(&FetchRequest {
            source_url: &spec.source_url,
            tag: &spec.tag,
            destination: &destination,
            timeout: spec.fetch_timeout,
        })?;

        fs::write(
            path.join(COMPLETE_MARKER),
            format!("{}\n{}\n", spec.source_url, spec.tag),
        )
        .map_err(io_failed)?;
        debug!("fetch of {} stored in {:?}", key, path);

        Ok(CacheEntry {
            key: key.clone(),
            path,
            fetched: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fakes::FakeFetcher,
        hasher::cache_key,
        models::{ImageName, PortSpec},
    };
    use tempfile::TempDir;

    fn spec(tag: &str) -> BuildSpec {
        BuildSpec {
            image_name: ImageName("webapp".into()),
            base_image: "base:1".into(),
            source_url: "https://example/repo".into(),
            tag: tag.into(),
            workdir: PathBuf::from("/app"),
            env: Vec::new(),
            exposed_port: PortSpec::tcp(5006),
            start_command: "serve".into(),
            fetch_timeout: None,
        }
    }

    #[test]
    fn completed_entries_are_reused() {
        let dir = TempDir::new().unwrap();
        let cache = FetchCache::new(dir.path());
        let mut fetcher = FakeFetcher::with_tags(&["v1"]);
        let spec = spec("v1");
        let key = cache_key(&spec.source_url, &spec.tag);

        let first = cache.ensure(&mut fetcher, &spec, &key).unwrap();
        let second = cache.ensure(&mut fetcher, &spec, &key).unwrap();

        assert!(first.fetched);
        assert!(!second.fetched);
        assert_eq!(fetcher.calls(), vec!["v1".to_string()]);
        assert!(first.path.join(CHECKOUT_DIR).is_dir());
    }

    #[test]
    fn failed_fetch_leaves_incomplete_entry_until_next_attempt() {
        let dir = TempDir::new().unwrap();
        let cache = FetchCache::new(dir.path());
        let spec = spec("v2");
        let key = cache_key(&spec.source_url, &spec.tag);

        let mut fetcher = FakeFetcher::with_tags(&["v1"]);
        let err = cache.ensure(&mut fetcher, &spec, &key).unwrap_err();
        assert!(matches!(err, BuildError::Fetch { .. }));
        assert!(cache.entry_path(&key).exists());
        assert!(!cache.is_complete(&key));

        let mut fetcher = FakeFetcher::with_tags(&["v2"]);
        let entry = cache.ensure(&mut fetcher, &spec, &key).unwrap();
        assert!(entry.fetched);
        assert!(cache.is_complete(&key));
    }

    #[cfg(unix)]
    mod git {
        use super::*;

        fn request<'a>(destination: &'a Path, timeout: Option<Duration>) -> FetchRequest<'a> {
            FetchRequest {
                source_url: "https://example/repo",
                tag: "v1.2.3",
                destination,
                timeout,
            }
        }

        #[test]
        fn passes_shallow_clone_arguments() {
            let dir = TempDir::new().unwrap();
            let destination = dir.path().join("checkout");
            let args = dir.path().join("args");
            let script = format!("printf '%s\\n' \"$@\" > '{}'", args.display());
            let mut fetcher = GitFetcher::with_command("sh", vec!["-c", script.as_str(), "git"]);

            fetcher.fetch(&request(&destination, None)).unwrap();

            let args = fs::read_to_string(args).unwrap();
            let args = args.lines().collect::<Vec<_>>();
            assert_eq!(
                args,
                vec![
                    "clone",
                    "--quiet",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    "v1.2.3",
                    "--",
                    "https://example/repo",
                    destination.to_str().unwrap(),
                ]
            );
        }

        #[test]
        fn missing_tag_reports_clone_output() {
            let dir = TempDir::new().unwrap();
            let script = "echo 'fatal: Remote branch v1.2.3 not found' >&2; exit 128";
            let mut fetcher = GitFetcher::with_command("sh", vec!["-c", script, "git"]);

            let err = fetcher.fetch(&request(dir.path(), None)).unwrap_err();
            match err {
                BuildError::Fetch { reason, tag, .. } => {
                    assert_eq!(tag, "v1.2.3");
                    assert!(reason.contains("Remote branch v1.2.3 not found"));
                }
                err => panic!("unexpected error: {:?}", err),
            }
        }

        #[test]
        fn slow_fetch_times_out() {
            let dir = TempDir::new().unwrap();
            let mut fetcher = GitFetcher::with_command("sh", vec!["-c", "sleep 5", "git"]);
            let started = Instant::now();

            let err = fetcher
                .fetch(&request(dir.path(), Some(Duration::from_millis(200))))
                .unwrap_err();

            assert!(matches!(err, BuildError::FetchTimeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[test]
        fn chatty_clone_does_not_stall() {
            let dir = TempDir::new().unwrap();
            let script = "head -c 262144 /dev/zero | tr '\\0' x >&2; echo >&2; echo 'fatal: bad ref' >&2; exit 128";
            let mut fetcher = GitFetcher::with_command("sh", vec!["-c", script, "git"]);

            let err = fetcher
                .fetch(&request(dir.path(), Some(Duration::from_secs(20))))
                .unwrap_err();

            match err {
                BuildError::Fetch { reason, .. } => assert!(reason.ends_with("fatal: bad ref")),
                err => panic!("unexpected error: {:?}", err),
            }
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn timeout_kills_helper_processes() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("helper.pid");
            let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
            let mut fetcher = GitFetcher::with_command("sh", vec!["-c", script.as_str(), "git"]);

            let err = fetcher
                .fetch(&request(dir.path(), Some(Duration::from_millis(500))))
                .unwrap_err();
            assert!(matches!(err, BuildError::FetchTimeout { .. }));

            let pid = fs::read_to_string(&pid_file).unwrap();
            let stat = Path::new("/proc").join(pid.trim()).join("stat");
            // A zombie waiting for its new parent counts as gone.
            let alive = || match fs::read_to_string(&stat) {
                Ok(stat) => !stat.rsplit(") ").next().unwrap().starts_with('Z'),
                Err(_) => false,
            };
            let deadline = Instant::now() + Duration::from_secs(5);
            while alive() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            assert!(!alive());
        }

        #[test]
        fn missing_program_is_a_fetch_error() {
            let dir = TempDir::new().unwrap();
            let mut fetcher = GitFetcher::with_command("pod-bake-no-such-git", Vec::<String>::new());

            let err = fetcher.fetch(&request(dir.path(), None)).unwrap_err();
            assert_eq!(err.exit_code(), 4);
        }
    }
}
