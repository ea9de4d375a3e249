//! # vmrest daemon supervisor
//!
//! VMware ships an optional HTTP management daemon, `vmrest`, which exposes
//! VM and virtual network APIs. [Vmrest] owns that daemon:
//!
//! - validates the installed version on construction
//! - bootstraps credentials and the daemon configuration on first run
//! - starts the process on demand, the first time someone needs the URL
//! - stops it after a period without activity or when the service exits
//!
//! ## Design
//!
//! A single runner task owns the process lifecycle and receives activity
//! signals on a channel, so there is never more than one live daemon. The
//! process itself is watched by a reaper task which clears the handle when it
//! exits, the next activity signal then starts a new one.
//!
//! ```text
//!  idle --activity--> starting --spawned--> running
//!   ^                                          |
//!   +------------- exit / keepalive -----------+
//!  any state --lifecycle shutdown--> stopped
//! ```
//!
//! When an external endpoint is configured no process is managed, the
//! supervisor only hands back the configured URL and credentials.
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};
use percent_encoding::percent_decode_str;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

use crate::{lifecycle::Lifecycle, process::Tool, status::Status};

pub mod client;
pub mod credentials;

pub use client::RestClient;
pub use credentials::Credentials;

/// Stop the daemon after this long without activity
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(300);

#[cfg(windows)]
const HOME_VARIABLE: &str = "USERPROFILE";
#[cfg(not(windows))]
const HOME_VARIABLE: &str = "HOME";

#[derive(Debug, thiserror::Error)]
pub enum VmrestError {
    #[error("failed to run vmrest binary: {0}")]
    Binary(String),
    #[error("failed to determine vmrest version: {0}")]
    Version(String),
    #[error("vmrest version {found} is incompatible, it must satisfy {required}")]
    Incompatible { found: String, required: String },
    #[error("failed to determine user home directory")]
    HomeDir,
    #[error("failed to allocate a free port: {0}")]
    Port(std::io::Error),
    #[error("failed to hash vmrest password: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid credential file {0}: {1}")]
    Credentials(PathBuf, String),
    #[error("vmrest configuration exists at {config} but the credential file {credentials} is missing, create it with the vmrest credentials: {{\"username\": \"USER\", \"password\": \"PASSWORD\"}}")]
    MissingCredentials { config: PathBuf, credentials: PathBuf },
    #[error("invalid vmrest URL {0}: {1}")]
    Url(String, String),
    #[error("failed to start vmrest process: {0}")]
    Start(String),
    #[error("vmrest supervisor is stopped")]
    Stopped,
}

impl From<VmrestError> for Status {
    fn from(e: VmrestError) -> Status {
        Status::unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Settings of a [Vmrest] supervisor
#[derive(Debug, Clone)]
pub struct VmrestConfig {
    /// Path to the `vmrest` binary
    pub binary: PathBuf,
    /// Service private JSON file holding the plaintext credentials
    pub credentials_file: PathBuf,
    /// Home directory given to the daemon, detected when not set
    pub home: Option<PathBuf>,
    /// Use an already running daemon, credentials are read from the URL
    pub external_url: Option<Url>,
    pub keepalive: Duration,
}

impl VmrestConfig {
    pub fn new(binary: PathBuf, credentials_file: PathBuf) -> VmrestConfig {
        VmrestConfig {
            binary,
            credentials_file,
            home: None,
            external_url: None,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    pub fn with_home(mut self, home: PathBuf) -> VmrestConfig {
        self.home = Some(home);
        self
    }

    pub fn with_external_url(mut self, url: Option<Url>) -> VmrestConfig {
        self.external_url = url;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> VmrestConfig {
        self.keepalive = keepalive;
        self
    }
}

type Activity = oneshot::Sender<Result<(), VmrestError>>;

#[derive(Debug)]
struct Process {
    generation: u64,
    kill: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Inner {
    state: SupervisorState,
    process: Option<Process>,
    generation: u64,
}

/// State shared between the supervisor, its runner, the reaper and the
/// shutdown hook
#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn state(&self) -> SupervisorState {
        self.lock().state
    }

    fn set_state(&self, state: SupervisorState) {
        let mut inner = self.lock();
        if inner.state != SupervisorState::Stopped {
            inner.state = state;
        }
    }

    fn has_process(&self) -> bool {
        self.lock().process.is_some()
    }

    /// Ask the reaper to kill the live process, if any
    fn kill(&self) {
        if let Some(process) = self.lock().process.take() {
            debug!("Killing vmrest process #{}", process.generation);
            let _ = process.kill.send(());
        }
    }

    fn stop(&self) {
        self.kill();
        self.lock().state = SupervisorState::Stopped;
    }
}

/// Supervisor of the vmrest daemon, see the module documentation
#[derive(Debug)]
pub struct Vmrest {
    url: Url,
    credentials: Credentials,
    activity: Option<mpsc::Sender<Activity>>,
    shared: Arc<Shared>,
}

impl Vmrest {
    /// Validate the daemon, bootstrap its configuration and start the
    /// supervisor. The daemon itself is only started on first activity.
    #[instrument(skip_all)]
    pub async fn start(lifecycle: &Lifecycle, config: VmrestConfig) -> Result<Vmrest, VmrestError> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SupervisorState::Idle,
                process: None,
                generation: 0,
            }),
        });

        if let Some(external) = &config.external_url {
            info!("Using external vmrest endpoint, process will not be managed");
            let (url, credentials) = external_endpoint(external)?;
            return Ok(Vmrest {
                url,
                credentials,
                activity: None,
                shared,
            });
        }

        let output = Tool::new("vmrest", &config.binary)
            .run(&["-v"])
            .await
            .map_err(|e| VmrestError::Binary(e.to_string()))?;
        credentials::check_version(&output.text())?;

        let home = config
            .home
            .clone()
            .or_else(credentials::home_dir)
            .ok_or(VmrestError::HomeDir)?;
        let (credentials, configured_port) = bootstrap(&home, &config.credentials_file)?;

        let port = match configured_port {
            Some(port) => port,
            None => credentials::free_port()?,
        };
        let url = Url::parse(&format!("http://localhost:{}/api", port))
            .map_err(|e| VmrestError::Url(port.to_string(), e.to_string()))?;
        debug!("vmrest will listen on {}", url);

        let (activity, receiver) = mpsc::channel(16);
        let runner = Runner {
            binary: config.binary.clone(),
            home,
            port,
            keepalive: config.keepalive,
            shared: shared.clone(),
            activity: receiver,
            cancel: lifecycle.subscribe(),
        };
        tokio::spawn(runner.run());

        let hook = shared.clone();
        lifecycle.on_shutdown("vmrest", move || hook.stop());

        Ok(Vmrest {
            url,
            credentials,
            activity: Some(activity),
            shared,
        })
    }

    /// Signal activity and return the daemon URL. Starts the daemon when it
    /// is not running and waits until the process is spawned.
    pub async fn active(&self) -> Result<Url, VmrestError> {
        if let Some(activity) = &self.activity {
            let (ack, done) = oneshot::channel();
            activity
                .send(ack)
                .await
                .map_err(|_| VmrestError::Stopped)?;
            done.await.map_err(|_| VmrestError::Stopped)??;
        }
        Ok(self.url.clone())
    }

    /// Base URL of the API, without signalling activity
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_external(&self) -> bool {
        self.activity.is_none()
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state()
    }

    /// Kill the daemon and refuse any further activity
    pub fn shutdown(&self) {
        self.shared.stop();
    }
}

fn external_endpoint(external: &Url) -> Result<(Url, Credentials), VmrestError> {
    let credentials = Credentials {
        username: decode_userinfo(external.username()),
        password: decode_userinfo(external.password().unwrap_or_default()),
    };
    let mut url = external.clone();
    url.set_path("/api");
    url.set_username("")
        .and_then(|_| url.set_password(None))
        .map_err(|_| VmrestError::Url(external.to_string(), "cannot hold credentials".into()))?;
    Ok((url, credentials))
}

/// Userinfo components of a URL are kept percent-encoded by [Url]
fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Create the daemon configuration on first run, read our copy of the
/// credentials afterwards. The port written in a fresh configuration is
/// returned along.
fn bootstrap(
    home: &Path,
    credentials_file: &Path,
) -> Result<(Credentials, Option<u16>), VmrestError> {
    let config = credentials::daemon_config_path(home);
    if config.exists() {
        if !credentials_file.exists() {
            return Err(VmrestError::MissingCredentials {
                config,
                credentials: credentials_file.to_path_buf(),
            });
        }
        debug!("Reusing vmrest configuration at {}", config.display());
        return Ok((Credentials::load(credentials_file)?, None));
    }

    info!("Bootstrapping vmrest configuration at {}", config.display());
    let credentials = Credentials::generate();
    let port = credentials::free_port()?;
    trace!("vmrest user {} on port {}", credentials.username, port);
    credentials::write_daemon_config(&config, port, &credentials)?;
    credentials.store(credentials_file)?;
    Ok((credentials, Some(port)))
}

struct Runner {
    binary: PathBuf,
    home: PathBuf,
    port: u16,
    keepalive: Duration,
    shared: Arc<Shared>,
    activity: mpsc::Receiver<Activity>,
    cancel: watch::Receiver<bool>,
}

impl Runner {
    async fn run(mut self) {
        let mut last_activity = Instant::now();
        loop {
            let idle_at = last_activity + self.keepalive;
            tokio::select! {
                biased;
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        debug!("vmrest runner cancelled");
                        break;
                    }
                }
                activity = self.activity.recv() => {
                    let Some(ack) = activity else {
                        debug!("vmrest supervisor dropped");
                        break;
                    };
                    last_activity = Instant::now();
                    let _ = ack.send(self.ensure_running());
                }
                _ = sleep_until(idle_at), if self.shared.has_process() => {
                    info!("No vmrest activity for {:?}, stopping process", self.keepalive);
                    self.shared.kill();
                }
            }
        }
        self.shared.stop();
    }

    fn ensure_running(&self) -> Result<(), VmrestError> {
        let generation = {
            let mut inner = self.shared.lock();
            match inner.state {
                SupervisorState::Stopped => return Err(VmrestError::Stopped),
                _ if inner.process.is_some() => {
                    trace!("vmrest already running");
                    return Ok(());
                }
                _ => {}
            }
            inner.state = SupervisorState::Starting;
            inner.generation += 1;
            inner.generation
        };

        info!("Starting vmrest process on port {}", self.port);
        let spawned = Command::new(&self.binary)
            .arg("-p")
            .arg(self.port.to_string())
            .env(HOME_VARIABLE, &self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn vmrest: {}", e);
                self.shared.set_state(SupervisorState::Idle);
                return Err(VmrestError::Start(e.to_string()));
            }
        };
        if child.id().is_none() {
            self.shared.set_state(SupervisorState::Idle);
            return Err(VmrestError::Start("process exited right away".to_string()));
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let (kill, killed) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            inner.process = Some(Process { generation, kill });
            if inner.state != SupervisorState::Stopped {
                inner.state = SupervisorState::Running;
            }
        }
        tokio::spawn(reap(child, killed, generation, self.shared.clone()));
        debug!("vmrest process #{} started", generation);
        Ok(())
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream, "vmrest: {}", line);
    }
}

/// Wait for the daemon to exit, or kill it when asked to
async fn reap(mut child: Child, killed: oneshot::Receiver<()>, generation: u64, shared: Arc<Shared>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = killed => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill vmrest process: {}", e);
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => info!("vmrest process #{} exited: {}", generation, status),
        Err(e) => warn!("Failed to reap vmrest process #{}: {}", generation, e),
    }

    let mut inner = shared.lock();
    if inner.generation == generation {
        inner.process = None;
        if inner.state != SupervisorState::Stopped {
            inner.state = SupervisorState::Idle;
        }
    }
}
