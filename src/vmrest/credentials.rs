//! First-run bootstrap of the vmrest daemon: random credentials, a free
//! port, the daemon's own configuration file and our private copy of the
//! plaintext credentials.
use std::{
    fmt, fs,
    net::TcpListener,
    path::{Path, PathBuf},
};

use rand::{rngs::OsRng, Rng};
use semver::{Version, VersionReq};
use tracing::{debug, trace};

use super::VmrestError;

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const SYMBOLS: &str = "!#$%&'()*+,-./:;<=>?@[]^_`{|}~";

/// Minimum vmrest release providing the API we use
pub const VERSION_CONSTRAINT: &str = ">= 1.2.0";

/// Plaintext credentials of the daemon, persisted as JSON
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn generate() -> Credentials {
        Credentials {
            username: generate_string(false, 0),
            password: generate_string(true, 0),
        }
    }

    pub fn load(path: &Path) -> Result<Credentials, VmrestError> {
        let content = fs::read(path).map_err(|e| VmrestError::Io {
            action: "read",
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&content)
            .map_err(|e| VmrestError::Credentials(path.to_path_buf(), e.to_string()))
    }

    pub fn store(&self, path: &Path) -> Result<(), VmrestError> {
        debug!("Storing vmrest credentials in {}", path.display());
        let io = |action: &'static str| {
            move |e: std::io::Error| VmrestError::Io {
                action,
                path: path.to_path_buf(),
                source: e,
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io("create directory for"))?;
        }
        let content = serde_json::to_vec(self)
            .map_err(|e| VmrestError::Credentials(path.to_path_buf(), e.to_string()))?;
        fs::write(path, content).map_err(io("write"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(io("set permissions on"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Random string cycling through lower case, digits, upper case and, when
/// requested, symbols so that every class shows up at least once. A zero
/// length picks one between 8 and 10.
pub fn generate_string(symbols: bool, length: usize) -> String {
    let mut rng = OsRng;
    let length = if length == 0 {
        8 + rng.gen_range(0..3)
    } else {
        length
    };
    let mut classes = vec![LOWER, DIGITS, UPPER];
    if symbols {
        classes.push(SYMBOLS);
    }
    (0..length)
        .map(|i| {
            let class = classes[i % classes.len()].as_bytes();
            class[rng.gen_range(0..class.len())] as char
        })
        .collect()
}

/// Ask the OS for an unused TCP port
pub fn free_port() -> Result<u16, VmrestError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(VmrestError::Port)?;
    let port = listener.local_addr().map_err(VmrestError::Port)?.port();
    trace!("Allocated free port {}", port);
    Ok(port)
}

/// Write the daemon's native configuration. Only a salted bcrypt hash of the
/// password is written.
pub fn write_daemon_config(
    path: &Path,
    port: u16,
    credentials: &Credentials,
) -> Result<(), VmrestError> {
    debug!("Writing vmrest configuration to {}", path.display());
    let salt = generate_string(true, 16);
    let hash = bcrypt::hash(format!("{}{}", salt, credentials.password), bcrypt::DEFAULT_COST)?;
    let content = format!(
        "port={}\r\nusername={}\r\npassword={}\r\nsalt={}\r\n",
        port, credentials.username, hash, salt
    );
    fs::write(path, content).map_err(|e| VmrestError::Io {
        action: "write",
        path: path.to_path_buf(),
        source: e,
    })
}

/// Location of the daemon configuration inside a home directory
pub fn daemon_config_path(home: &Path) -> PathBuf {
    if cfg!(windows) {
        home.join("vmrest.cfg")
    } else {
        home.join(".vmrestCfg")
    }
}

/// Home directory of the current user. The SYSTEM account on Windows gets
/// its profile redirected to SysWOW64 for 32-bit processes, which is where
/// vmrest looks for its configuration.
pub fn home_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    if cfg!(windows) && is_system_account() {
        let adjusted = home.to_string_lossy().replace("system32", "SysWOW64");
        debug!("Running as SYSTEM, using home directory {}", adjusted);
        return Some(PathBuf::from(adjusted));
    }
    Some(home)
}

fn is_system_account() -> bool {
    std::env::var("USERNAME")
        .map(|user| {
            let user = user.to_lowercase();
            user == "system" || user.ends_with('$')
        })
        .unwrap_or(false)
}

/// Extract the version out of `vmrest -v`
pub fn parse_version(output: &str) -> Option<Version> {
    output.match_indices("vmrest ").find_map(|(idx, matched)| {
        let rest = &output[idx + matched.len()..];
        let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        if end == 0 || !rest[end..].starts_with(' ') {
            return None;
        }
        lenient_version(&rest[..end])
    })
}

/// `1.2` is read as `1.2.0`, extra components are ignored
fn lenient_version(raw: &str) -> Option<Version> {
    let mut parts = raw
        .trim_matches('.')
        .split('.')
        .map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    Some(Version::new(major, minor, patch))
}

/// Validate the output of `vmrest -v` against [VERSION_CONSTRAINT]
pub fn check_version(output: &str) -> Result<Version, VmrestError> {
    let version = parse_version(output)
        .ok_or_else(|| VmrestError::Version(format!("unexpected output: {}", output.trim())))?;
    let requirement = VersionReq::parse(VERSION_CONSTRAINT)
        .map_err(|e| VmrestError::Version(e.to_string()))?;
    if !requirement.matches(&version) {
        return Err(VmrestError::Incompatible {
            found: version.to_string(),
            required: VERSION_CONSTRAINT.to_string(),
        });
    }
    debug!("Found compatible vmrest version {}", version);
    Ok(version)
}
