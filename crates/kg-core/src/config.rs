use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{KernelError, Result};

/// Name of the file that proves the cache directory is writable.
pub const MARKER_FILE: &str = ".kg-writable";

/// Settings for native kernel compilation, read once per context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Explicit cache directory. It must already exist; only the default
    /// location is created on demand.
    pub compiledir: Option<PathBuf>,
    /// Extra header included by BLAS-backed kernels. When absent, kernels
    /// declare the two cblas entry points they call themselves.
    pub cblas_header: Option<String>,
    /// Libraries linked into BLAS-backed kernels, without the `-l` prefix.
    pub blas_libs: Vec<String>,
    /// C compiler executable.
    pub cc: String,
    /// Flags passed to every compilation.
    pub cflags: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compiledir: None,
            cblas_header: None,
            blas_libs: vec!["blas".to_string(), "m".to_string()],
            cc: "cc".to_string(),
            cflags: default_cflags(),
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// - `KG_COMPILEDIR` -> compiledir
    /// - `KG_CBLAS_H` -> cblas_header
    /// - `KG_BLAS_LDFLAGS` -> blas_libs (whitespace separated, `-l` optional)
    /// - `CC` -> cc
    pub fn from_env() -> Config {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("KG_COMPILEDIR") {
            config.compiledir = Some(PathBuf::from(dir));
        }
        if let Some(header) = non_empty("KG_CBLAS_H") {
            config.cblas_header = Some(header.trim().to_string());
        }
        if let Some(flags) = non_empty("KG_BLAS_LDFLAGS") {
            config.blas_libs = parse_libs(&flags);
        }
        if let Some(cc) = non_empty("CC") {
            config.cc = cc.trim().to_string();
        }
        config
    }

    pub fn with_compiledir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.compiledir = Some(dir.into());
        self
    }

    pub fn with_cblas_header(mut self, header: impl Into<String>) -> Self {
        self.cblas_header = Some(header.into());
        self
    }

    pub fn with_blas_libs<I, S>(mut self, libs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blas_libs = libs
            .into_iter()
            .map(|lib| strip_link_prefix(lib.as_ref()).to_string())
            .collect();
        self
    }

    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc = cc.into();
        self
    }

    /// Resolve the cache directory and prove it is writable.
    ///
    /// An explicit directory must exist. The default per-user directory is
    /// created when missing. Either way the marker file is touched.
    pub fn resolve_compiledir(&self) -> Result<PathBuf> {
        let dir = match &self.compiledir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(KernelError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("compile directory {} does not exist", dir.display()),
                    )));
                }
                dir.clone()
            }
            None => {
                let dir = default_compiledir();
                fs::create_dir_all(&dir)?;
                dir
            }
        };
        touch_marker(&dir)?;
        Ok(dir)
    }
}

/// Per-user cache location derived from the platform identity.
pub fn default_compiledir() -> PathBuf {
    let platform = format!(
        "compiledir_{}-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::env::consts::FAMILY
    );
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kernelgraph")
        .join(platform)
}

fn touch_marker(dir: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(MARKER_FILE))?;
    Ok(())
}

fn default_cflags() -> Vec<String> {
    let mut flags = vec!["-O3".to_string()];
    if cfg!(target_os = "macos") {
        flags.push("-dynamiclib".to_string());
    } else {
        flags.push("-fPIC".to_string());
        flags.push("-shared".to_string());
    }
    flags
}

fn parse_libs(flags: &str) -> Vec<String> {
    flags
        .split_whitespace()
        .map(strip_link_prefix)
        .filter(|lib| !lib.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_link_prefix(lib: &str) -> &str {
    lib.strip_prefix("-l").unwrap_or(lib)
}
