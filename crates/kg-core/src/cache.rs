use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Instant;

use kg_tensor::{DType, Tensor};
use libloading::Library;
use tracing::{debug, info, trace};

use crate::codegen::{self, KernelUnit, LoopPath};
use crate::config::Config;
use crate::error::{KernelError, Result};

/// Prefix of the private directories compilations run in.
pub const SCRATCH_PREFIX: &str = ".kg-build-";

/// Mirror of the C `kg_buffer` descriptor.
#[repr(C)]
struct RawBuffer {
    data: *mut c_void,
    nd: i64,
    dims: *const i64,
    strides: *const i64,
    dtype: i32,
}

type InstantiateFn = unsafe extern "C" fn(*const RawBuffer, i64, i32) -> *mut c_void;
type ExecuteFn = unsafe extern "C" fn(*mut c_void) -> i32;
type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Outcome of a kernel run that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkStatus {
    Done,
    /// The kernel does not handle these buffers; run the interpreted
    /// implementation instead.
    Unsupported,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from memory or from disk.
    pub hits: usize,
    /// Native compilations performed.
    pub compilations: usize,
}

/// A loaded kernel artifact and its lifecycle entry points.
pub struct CompiledModule {
    op: String,
    name: String,
    path: PathBuf,
    instantiate: InstantiateFn,
    execute: ExecuteFn,
    destroy: DestroyFn,
    _lib: Library,
}

impl CompiledModule {
    fn load(op: &str, unit: &KernelUnit, path: &Path) -> Result<Self> {
        // SAFETY: artifacts are only ever produced from generated units that
        // run no code at load time.
        let lib = unsafe { Library::new(path) }?;
        let instantiate = unsafe {
            *lib.get::<InstantiateFn>(unit.instantiate_symbol().as_bytes())?
        };
        let execute = unsafe { *lib.get::<ExecuteFn>(unit.execute_symbol().as_bytes())? };
        let destroy = unsafe { *lib.get::<DestroyFn>(unit.destroy_symbol().as_bytes())? };
        Ok(CompiledModule {
            op: op.to_string(),
            name: unit.name.clone(),
            path: path.to_path_buf(),
            instantiate,
            execute,
            destroy,
            _lib: lib,
        })
    }

    /// Unit name, `kg_<op>_<hash16>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the loaded artifact.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the module to concrete buffers, inputs first then outputs.
    pub fn instantiate(self: &Rc<Self>, buffers: &[Tensor], path: LoopPath) -> Result<Thunk> {
        let dims: Vec<Vec<i64>> = buffers
            .iter()
            .map(|t| t.shape().dims().iter().map(|&d| d as i64).collect())
            .collect();
        let strides: Vec<Vec<i64>> = buffers
            .iter()
            .map(|t| t.strides().iter().map(|&s| s as i64).collect())
            .collect();
        let raw: Vec<RawBuffer> = buffers
            .iter()
            .zip(dims.iter().zip(&strides))
            .map(|(t, (d, s))| RawBuffer {
                data: t.data_ptr() as *mut c_void,
                nd: d.len() as i64,
                dims: d.as_ptr(),
                strides: s.as_ptr(),
                dtype: t.dtype().tag(),
            })
            .collect();

        // SAFETY: `raw` describes live buffers and the dims/strides arrays
        // move into the thunk, which outlives the native handle.
        let handle = unsafe { (self.instantiate)(raw.as_ptr(), raw.len() as i64, path.code()) };
        let handle = NonNull::new(handle).ok_or_else(|| KernelError::KernelRuntime {
            op: self.op.clone(),
            status: -1,
        })?;

        Ok(Thunk {
            module: Rc::clone(self),
            handle,
            tensors: buffers.to_vec(),
            dtypes: codegen::dtypes_of(buffers),
            _dims: dims,
            _strides: strides,
            path,
        })
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("op", &self.op)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// A kernel bound to concrete buffers, ready to run.
///
/// The thunk keeps its buffers alive for as long as the native side may
/// address them.
pub struct Thunk {
    module: Rc<CompiledModule>,
    handle: NonNull<c_void>,
    tensors: Vec<Tensor>,
    dtypes: Vec<DType>,
    _dims: Vec<Vec<i64>>,
    _strides: Vec<Vec<i64>>,
    path: LoopPath,
}

impl Thunk {
    pub fn module(&self) -> &Rc<CompiledModule> {
        &self.module
    }

    pub fn dtypes(&self) -> &[DType] {
        &self.dtypes
    }

    pub fn path(&self) -> LoopPath {
        self.path
    }

    /// True if this thunk addresses exactly `buffers` with `path`.
    pub fn is_bound_to(&self, buffers: &[Tensor], path: LoopPath) -> bool {
        self.path == path
            && self.tensors.len() == buffers.len()
            && self
                .tensors
                .iter()
                .zip(buffers)
                .all(|(bound, t)| bound.same_binding(t))
    }

    /// Run the kernel once.
    pub fn run(&self) -> Result<ThunkStatus> {
        trace!(unit = %self.module.name, "running thunk");
        // SAFETY: the handle came from this module's instantiate and is
        // released only on drop.
        let status = unsafe { (self.module.execute)(self.handle.as_ptr()) };
        match status {
            0 => Ok(ThunkStatus::Done),
            1 => Ok(ThunkStatus::Unsupported),
            status => Err(KernelError::KernelRuntime {
                op: self.module.op.clone(),
                status,
            }),
        }
    }
}

impl Drop for Thunk {
    fn drop(&mut self) {
        // SAFETY: the handle is released exactly once.
        unsafe { (self.module.destroy)(self.handle.as_ptr()) };
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("unit", &self.module.name)
            .field("dtypes", &self.dtypes)
            .field("path", &self.path)
            .finish()
    }
}

/// Content-addressed store of compiled kernels.
///
/// Lookups try the loaded modules, then every directory of the search
/// path, and compile only when both miss. Artifacts are built in a scratch
/// directory inside the cache directory and published with a rename, so
/// another process sees either no artifact or a complete one.
pub struct KernelCache {
    config: Config,
    dir: PathBuf,
    search_path: Vec<PathBuf>,
    modules: HashMap<String, Rc<CompiledModule>>,
    stats: CacheStats,
}

impl KernelCache {
    /// Open the cache directory named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        let dir = config.resolve_compiledir()?;
        debug!(dir = %dir.display(), "opened kernel cache");
        Ok(KernelCache {
            search_path: vec![dir.clone()],
            config,
            dir,
            modules: HashMap::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Also look for prebuilt artifacts in `dir`.
    pub fn add_search_path(&mut self, dir: impl Into<PathBuf>) {
        self.search_path.push(dir.into());
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Return the module for `unit`, compiling it on a miss.
    pub fn get_or_compile(
        &mut self,
        op: &str,
        unit: &KernelUnit,
        libs: &[String],
    ) -> Result<Rc<CompiledModule>> {
        let libs = dedup(libs);
        let key = artifact_key(unit, &libs);
        if let Some(module) = self.modules.get(&key) {
            self.stats.hits += 1;
            debug!(op, unit = %unit.name, "kernel cache hit (memory)");
            return Ok(Rc::clone(module));
        }

        let file = artifact_file_name(&key);
        let found = self
            .search_path
            .iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file());
        let path = match found {
            Some(path) => {
                self.stats.hits += 1;
                debug!(op, unit = %unit.name, path = %path.display(), "kernel cache hit (disk)");
                path
            }
            None => {
                let path = self.compile(op, unit, &libs, &file)?;
                self.stats.compilations += 1;
                path
            }
        };

        let module = Rc::new(CompiledModule::load(op, unit, &path)?);
        self.modules.insert(key, Rc::clone(&module));
        Ok(module)
    }

    fn compile(&self, op: &str, unit: &KernelUnit, libs: &[String], file: &str) -> Result<PathBuf> {
        let failure = |stderr: String| KernelError::CompilationFailure {
            op: op.to_string(),
            hash: unit.hash.clone(),
            stderr,
        };

        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.dir)?;
        let src = scratch.path().join(format!("{}.c", unit.name));
        fs::write(&src, &unit.source)?;
        let staged = scratch.path().join(file);

        let mut cmd = Command::new(&self.config.cc);
        cmd.args(&self.config.cflags)
            .arg("-o")
            .arg(&staged)
            .arg(&src);
        for lib in libs {
            cmd.arg(format!("-l{lib}"));
        }

        let started = Instant::now();
        let output = cmd
            .output()
            .map_err(|err| failure(format!("failed to run {}: {err}", self.config.cc)))?;
        if !output.status.success() {
            return Err(failure(String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        let target = self.dir.join(file);
        fs::rename(&staged, &target)?;
        info!(
            op,
            unit = %unit.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled kernel"
        );
        Ok(target)
    }
}

/// Identity of a compiled artifact: the full source plus what it links.
pub fn artifact_key(unit: &KernelUnit, libs: &[String]) -> String {
    let mut data = unit.source.clone().into_bytes();
    for lib in libs {
        data.push(0);
        data.extend_from_slice(lib.as_bytes());
    }
    codegen::sha256_hex(&data)
}

pub fn artifact_file_name(key: &str) -> String {
    format!("kg_{key}{}", lib_ext())
}

fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn dedup(libs: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(libs.len());
    for lib in libs {
        if !out.contains(lib) {
            out.push(lib.clone());
        }
    }
    out
}
