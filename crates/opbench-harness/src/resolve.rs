//! Operator symbol resolution.
//!
//! All function pointer casts happen here. The rest of the harness only
//! sees a [`Kernel`], which is safe to hold and unsafe only to invoke.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use libloading::Library;
use tracing::{debug, info};

use crate::abi::{InputView, KernelFn, KernelStatus, OutputView};
use crate::device::StreamHandle;
use crate::error::HarnessError;

/// Source of operator entry points.
pub trait KernelLoader {
    fn resolve(&self, library: &Path, symbol: &str) -> Result<Kernel, HarnessError>;
}

impl<L: KernelLoader + ?Sized> KernelLoader for &L {
    fn resolve(&self, library: &Path, symbol: &str) -> Result<Kernel, HarnessError> {
        (**self).resolve(library, symbol)
    }
}

/// A resolved operator entry point. Keeps its library loaded for as long
/// as it is alive.
#[derive(Clone)]
pub struct Kernel {
    func: KernelFn,
    symbol: String,
    _library: Option<Arc<Library>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("symbol", &self.symbol)
            .field("func", &(self.func as *const ()))
            .finish()
    }
}

impl Kernel {
    /// Wrap an entry point linked into this process.
    pub fn from_fn(symbol: impl Into<String>, func: KernelFn) -> Self {
        Self {
            func,
            symbol: symbol.into(),
            _library: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Call the operator once.
    ///
    /// # Safety
    ///
    /// The views must describe live device buffers on the device that owns
    /// `stream`, and the entry point must honour [`KernelFn`]'s contract.
    pub unsafe fn invoke(
        &self,
        inputs: &[InputView],
        outputs: &[OutputView],
        stream: StreamHandle,
        threads_per_block: u16,
    ) -> KernelStatus {
        let code = unsafe {
            (self.func)(
                inputs.as_ptr(),
                inputs.len(),
                outputs.as_ptr(),
                outputs.len(),
                stream.as_raw(),
                threads_per_block,
            )
        };
        KernelStatus(code)
    }
}

/// Loads operator libraries from disk with lazy symbol binding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl DynamicLoader {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> Result<Library, libloading::Error> {
        #[cfg(unix)]
        {
            use libloading::os::unix;
            // SAFETY: running library initializers is inherent to loading an
            // operator; the caller chose the path.
            unsafe { unix::Library::open(Some(path), unix::RTLD_LAZY) }.map(Library::from)
        }
        #[cfg(not(unix))]
        {
            // SAFETY: as above.
            unsafe { Library::new(path) }
        }
    }
}

impl KernelLoader for DynamicLoader {
    fn resolve(&self, library: &Path, symbol: &str) -> Result<Kernel, HarnessError> {
        let lib = Self::open(library).map_err(|e| HarnessError::LibraryNotFound {
            path: library.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("opened operator library {}", library.display());

        let missing = || HarnessError::SymbolNotFound {
            library: library.display().to_string(),
            symbol: symbol.to_string(),
        };
        if symbol.is_empty() || symbol.contains('\0') {
            return Err(missing());
        }
        // SAFETY: the exported symbol is required to have the KernelFn
        // signature; that is the operator library contract.
        let func: KernelFn = unsafe { lib.get::<KernelFn>(symbol.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|e| {
                debug!("symbol lookup failed: {}", e);
                missing()
            })?;

        info!("resolved {} in {}", symbol, library.display());
        Ok(Kernel {
            func,
            symbol: symbol.to_string(),
            _library: Some(Arc::new(lib)),
        })
    }
}

/// In-process registry of operator entry points keyed by library path and
/// symbol name.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: DashMap<(PathBuf, String), KernelFn>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, library: impl Into<PathBuf>, symbol: impl Into<String>, func: KernelFn) {
        self.entries.insert((library.into(), symbol.into()), func);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(self, library: impl Into<PathBuf>, symbol: impl Into<String>, func: KernelFn) -> Self {
        self.register(library, symbol, func);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KernelLoader for SymbolTable {
    fn resolve(&self, library: &Path, symbol: &str) -> Result<Kernel, HarnessError> {
        let key = (library.to_path_buf(), symbol.to_string());
        if let Some(func) = self.entries.get(&key) {
            return Ok(Kernel::from_fn(symbol, *func));
        }
        if self.entries.iter().any(|e| e.key().0 == library) {
            Err(HarnessError::SymbolNotFound {
                library: library.display().to_string(),
                symbol: symbol.to_string(),
            })
        } else {
            Err(HarnessError::LibraryNotFound {
                path: library.display().to_string(),
                reason: "not registered".to_string(),
            })
        }
    }
}
