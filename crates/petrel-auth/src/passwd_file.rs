//! Flat-file password database.
//!
//! One user per line:
//!
//! ```text
//! user:password:uid:gid:gecos:home:mail:extra
//! ```
//!
//! Only the first two fields are required; `home` and `mail` are kept when
//! present, the rest is ignored. `#` comments, blank lines and malformed
//! lines are skipped (malformed ones with a warning, so a typo doesn't
//! silently lock a user out).
//!
//! Databases are shared through a module-scope registry keyed by path:
//! when the passdb and the userdb point at the same file it is parsed
//! once, and the entry lives until the last [`SharedPasswdFile`] handle is
//! dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::scheme::{self, split_scheme, DEFAULT_SCHEME};

/// One parsed passwd-file entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswdUser {
    /// Login name, the lookup key.
    pub username: String,
    /// Stored password, still carrying its `{SCHEME}` prefix if any.
    pub password: String,
    /// Home directory, when the file provides one.
    pub home: Option<String>,
    /// Mail location, when the file provides one.
    pub mail: Option<String>,
}

/// Outcome of a password verification against the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassdbResult {
    /// The user exists and the password matches.
    Ok,
    /// No such user in the file.
    UserUnknown,
    /// The user exists but the password does not match (or its stored
    /// scheme is unsupported, which is logged and reported the same way).
    PasswordMismatch,
}

/// A parsed passwd file.
#[derive(Debug)]
pub struct PasswdFile {
    path: PathBuf,
    users: HashMap<String, PasswdUser>,
}

impl PasswdFile {
    /// Parses the file at `path`.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = std::fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        let mut users = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some(user) => {
                    users.insert(user.username.clone(), user);
                }
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        "skipping malformed passwd-file line"
                    );
                }
            }
        }

        tracing::debug!(path = %path.display(), users = users.len(), "parsed passwd file");
        Ok(Self { path, users })
    }

    fn parse_line(line: &str) -> Option<PasswdUser> {
        let mut fields = line.split(':');
        let username = fields.next()?;
        if username.is_empty() {
            return None;
        }
        let password = fields.next()?;

        // uid, gid and gecos are the system-passwd legacy fields
        let _uid = fields.next();
        let _gid = fields.next();
        let _gecos = fields.next();
        let home = fields.next().filter(|f| !f.is_empty());
        let mail = fields.next().filter(|f| !f.is_empty());

        Some(PasswdUser {
            username: username.to_string(),
            password: password.to_string(),
            home: home.map(str::to_string),
            mail: mail.map(str::to_string),
        })
    }

    /// Path this database was parsed from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks a user up by name.
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<&PasswdUser> {
        self.users.get(username)
    }

    /// Verifies a plaintext password for `username`.
    ///
    /// An unsupported stored scheme is logged as an error and reported as
    /// [`PassdbResult::PasswordMismatch`] — a misconfigured entry must not
    /// let anyone in.
    #[must_use]
    pub fn verify_plain(&self, username: &str, password: &str) -> PassdbResult {
        let Some(user) = self.lookup(username) else {
            return PassdbResult::UserUnknown;
        };

        let (scheme, secret) = split_scheme(&user.password);
        let scheme = scheme.unwrap_or(DEFAULT_SCHEME);
        match scheme::verify(scheme, password, secret) {
            Ok(true) => PassdbResult::Ok,
            Ok(false) => {
                tracing::info!(user = username, "passwd-file: password mismatch");
                PassdbResult::PasswordMismatch
            }
            Err(err) => {
                tracing::error!(user = username, error = %err, "passwd-file: cannot verify");
                PassdbResult::PasswordMismatch
            }
        }
    }

    /// Returns the stored credentials for `username` as `(scheme, secret)`,
    /// for mechanisms that verify on their own (e.g. CRAM-MD5 style
    /// challenges need the stored secret, not a yes/no).
    #[must_use]
    pub fn lookup_credentials(&self, username: &str) -> Option<(String, String)> {
        let user = self.lookup(username)?;
        let (scheme, secret) = split_scheme(&user.password);
        Some((
            scheme.unwrap_or(DEFAULT_SCHEME).to_string(),
            secret.to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Shared registry
// ---------------------------------------------------------------------------

struct RegistryEntry {
    db: Arc<PasswdFile>,
    use_count: usize,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, RegistryEntry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, RegistryEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle to a registry-shared [`PasswdFile`]. Dropping the last handle
/// for a path removes the parsed database from the registry.
pub struct SharedPasswdFile {
    path: PathBuf,
    db: Arc<PasswdFile>,
}

impl std::ops::Deref for SharedPasswdFile {
    type Target = PasswdFile;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl Drop for SharedPasswdFile {
    fn drop(&mut self) {
        let mut registry = registry().lock();
        if let Some(entry) = registry.get_mut(&self.path) {
            entry.use_count -= 1;
            if entry.use_count == 0 {
                registry.remove(&self.path);
            }
        }
    }
}

/// Opens the passwd file at `path`, sharing the parsed database with any
/// other open handle for the same path.
pub fn open<P: AsRef<Path>>(path: P) -> Result<SharedPasswdFile> {
    let path = path.as_ref().to_path_buf();
    let mut registry = registry().lock();

    if let Some(entry) = registry.get_mut(&path) {
        entry.use_count += 1;
        return Ok(SharedPasswdFile {
            path,
            db: Arc::clone(&entry.db),
        });
    }

    let db = Arc::new(PasswdFile::parse(&path)?);
    registry.insert(
        path.clone(),
        RegistryEntry {
            db: Arc::clone(&db),
            use_count: 1,
        },
    );
    Ok(SharedPasswdFile { path, db })
}

/// Registry use count for `path`; test support.
#[cfg(test)]
pub(crate) fn registry_use_count(path: &Path) -> Option<usize> {
    registry().lock().get(path).map(|entry| entry.use_count)
}
