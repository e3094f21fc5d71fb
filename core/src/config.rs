use std::fs;
use std::io;
use std::path::PathBuf;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Returns the per-user configuration root for nimbus.
///
/// Honors the `NIMBUS_HOME` environment variable (used by tests and portable
/// installs); otherwise resolves to `~/.nimbus`.
pub fn nimbus_home() -> io::Result<PathBuf> {
    if let Ok(home) = std::env::var("NIMBUS_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    let mut dir = dirs::home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not resolve home directory")
    })?;
    dir.push(".nimbus");
    Ok(dir)
}

/// Resolved layout of the on-disk state under the configuration root.
/// Directories are created lazily by the accessor that needs them.
#[derive(Debug, Clone)]
pub struct NimbusHome {
    root: PathBuf,
}

impl NimbusHome {
    pub fn resolve() -> io::Result<Self> {
        Ok(Self {
            root: nimbus_home()?,
        })
    }

    /// Root every store hangs off. Tests point this at a temp directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn history_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "history"])
    }

    pub fn memory_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "memory"])
    }

    pub fn project_memory_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "memory", "projects"])
    }

    pub fn projects_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "projects"])
    }

    pub fn audit_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "audit"])
    }

    pub fn tunnel_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "tunnel"])
    }

    pub fn keys_dir(&self) -> io::Result<PathBuf> {
        self.ensured(&["data", "keys"])
    }

    pub fn settings_file(&self) -> io::Result<PathBuf> {
        Ok(self.ensured(&["data"])?.join("settings.json"))
    }

    fn ensured(&self, parts: &[&str]) -> io::Result<PathBuf> {
        let mut dir = self.root.clone();
        for part in parts {
            dir.push(part);
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Current UTC time as an RFC 3339 string, the timestamp format used by
/// every store and audit record.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
