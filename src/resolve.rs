use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Simplified emulation of the Windows DLL search order.
///
/// Names are tried under the target's executable directory, the system
/// directory, and the Windows directory, in that order. This is a deliberate
/// reduction: activation contexts, manifests, `KnownDLLs`, per-application
/// redirection, `%PATH%` and the 16-bit system directory are not consulted.
pub struct SearchOrder {
    directories: Vec<PathBuf>,
}

impl SearchOrder {
    /// Build a search order over an explicit directory list.
    pub fn new(directories: Vec<PathBuf>) -> Self {
        SearchOrder { directories }
    }

    /// The search order the target process would use: its executable's
    /// directory, then the system directory, then the Windows directory.
    #[cfg(windows)]
    pub fn for_process<M: crate::memory::ProcessMemory>(memory: &M) -> Result<Self> {
        let executable = memory.process_path()?;
        let executable_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(executable);

        Ok(SearchOrder::new(vec![
            executable_dir,
            crate::host::system_directory()?,
            crate::host::windows_directory()?,
        ]))
    }

    /// Map a library name or path to an absolute on-disk path.
    ///
    /// In explicit-path mode (`use_search_order` false) a relative name is
    /// made absolute against the caller's directory and must exist. In
    /// search-order mode the name is tried under each search directory and
    /// the first hit wins.
    pub fn resolve(
        &self,
        name: &Path,
        use_search_order: bool,
        caller_dir: &Path,
    ) -> Result<PathBuf> {
        if use_search_order {
            for directory in &self.directories {
                let candidate = directory.join(name);
                if candidate.exists() {
                    trace!(path = %candidate.display(), "search order hit");
                    return Ok(make_preferred(candidate));
                }
            }
            Err(Error::ModuleNotFound(name.display().to_string()))
        } else {
            let absolute = if name.is_relative() {
                caller_dir.join(name)
            } else {
                name.to_path_buf()
            };
            if absolute.exists() {
                Ok(make_preferred(absolute))
            } else {
                Err(Error::ModuleNotFound(name.display().to_string()))
            }
        }
    }
}

/// The cache key for a resolved path: case-folded, with the platform's
/// preferred separators. Two spellings of the same module must always
/// produce the same key.
pub fn cache_key(path: &Path) -> String {
    let text = path.to_string_lossy();
    #[cfg(windows)]
    let text = text.replace('/', "\\");
    text.to_lowercase()
}

#[cfg(windows)]
fn make_preferred(path: PathBuf) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace('/', "\\"))
}

#[cfg(not(windows))]
fn make_preferred(path: PathBuf) -> PathBuf {
    path
}
