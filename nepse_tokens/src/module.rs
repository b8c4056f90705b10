//! The WebAssembly boundary hosting the salt derivation functions
//!
//! The derivation functions are opaque: they are only ever executed in their
//! compiled form. [`DerivationModule`] owns a single sandbox for the lifetime
//! of a credential manager and serializes every call into it, since a
//! `wasmtime::Store` is not shareable between threads.

use std::{fmt, path::Path};

use parking_lot::Mutex;
use thiserror::Error;
use wasmtime::{Engine, Instance, Module, Store, TypedFunc};

/// Arguments accepted by every derivation function
pub type DerivationArgs = (i32, i32, i32, i32, i32);

/// One of the five functions exported by the derivation module
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DerivationFn {
    /// The `cdx` export
    Cdx,
    /// The `rdx` export
    Rdx,
    /// The `bdx` export
    Bdx,
    /// The `ndx` export
    Ndx,
    /// The `mdx` export
    Mdx,
}

impl DerivationFn {
    /// Every derivation function, in index order
    pub const ALL: [DerivationFn; 5] = [
        DerivationFn::Cdx,
        DerivationFn::Rdx,
        DerivationFn::Bdx,
        DerivationFn::Ndx,
        DerivationFn::Mdx,
    ];

    /// The name under which the module exports this function
    pub const fn export_name(self) -> &'static str {
        match self {
            DerivationFn::Cdx => "cdx",
            DerivationFn::Rdx => "rdx",
            DerivationFn::Bdx => "bdx",
            DerivationFn::Ndx => "ndx",
            DerivationFn::Mdx => "mdx",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DerivationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Errors raised at the module boundary
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    /// The module could not be compiled or instantiated
    #[error("failed to load derivation module: {message}")]
    Load {
        /// The runtime's description of the failure
        message: String,
    },
    /// The module does not export one of the required functions
    #[error("derivation module does not export `{name}`")]
    ExportMissing {
        /// The missing export
        name: &'static str,
    },
    /// An export exists but does not take five `i32`s and return one
    #[error("derivation module export `{name}` has an unexpected signature: {message}")]
    ExportSignature {
        /// The offending export
        name: &'static str,
        /// The runtime's description of the mismatch
        message: String,
    },
    /// A call into the module trapped
    #[error("call to `{function}` failed: {message}")]
    Call {
        /// The function that was called
        function: DerivationFn,
        /// The runtime's description of the trap
        message: String,
    },
    /// The module has already been released
    #[error("derivation module has been closed")]
    Closed,
}

/// The calling convention for the derivation functions
///
/// [`DerivationModule`] is the production implementation. Anything that can
/// answer the five functions deterministically may stand in for it.
pub trait DerivationFunctions: Send + Sync {
    /// Invokes `function` with the five arguments in order
    fn call(&self, function: DerivationFn, args: [i32; 5]) -> Result<i32, ModuleError>;

    /// Releases any resources held by the implementation
    ///
    /// Must be idempotent.
    fn close(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

struct Sandbox {
    store: Store<()>,
    exports: [TypedFunc<DerivationArgs, i32>; 5],
}

/// A compiled and instantiated derivation module
pub struct DerivationModule {
    sandbox: Mutex<Option<Sandbox>>,
}

impl DerivationModule {
    /// Compiles and instantiates a module from its binary (or text) encoding,
    /// verifying that all five derivation functions are exported
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, ModuleError> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes.as_ref()).map_err(|err| ModuleError::Load {
            message: format!("{err:#}"),
        })?;

        let mut store = Store::new(&engine, ());
        let instance =
            Instance::new(&mut store, &module, &[]).map_err(|err| ModuleError::Load {
                message: format!("{err:#}"),
            })?;

        let mut lookup = |function: DerivationFn| {
            let name = function.export_name();
            instance
                .get_func(&mut store, name)
                .ok_or(ModuleError::ExportMissing { name })?
                .typed::<DerivationArgs, i32>(&store)
                .map_err(|err| ModuleError::ExportSignature {
                    name,
                    message: format!("{err:#}"),
                })
        };

        let exports = [
            lookup(DerivationFn::Cdx)?,
            lookup(DerivationFn::Rdx)?,
            lookup(DerivationFn::Bdx)?,
            lookup(DerivationFn::Ndx)?,
            lookup(DerivationFn::Mdx)?,
        ];

        tracing::debug!("derivation module instantiated");

        Ok(Self {
            sandbox: Mutex::new(Some(Sandbox { store, exports })),
        })
    }

    /// Reads a module from disk and loads it with [`from_bytes()`][Self::from_bytes()]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModuleError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| ModuleError::Load {
            message: format!("unable to read {}: {err}", path.display()),
        })?;
        Self::from_bytes(bytes)
    }

    /// Whether the sandbox has been released
    pub fn is_closed(&self) -> bool {
        self.sandbox.lock().is_none()
    }
}

impl DerivationFunctions for DerivationModule {
    fn call(&self, function: DerivationFn, args: [i32; 5]) -> Result<i32, ModuleError> {
        let mut guard = self.sandbox.lock();
        let sandbox = guard.as_mut().ok_or(ModuleError::Closed)?;

        let [a, b, c, d, e] = args;
        let result = sandbox.exports[function.slot()]
            .call(&mut sandbox.store, (a, b, c, d, e))
            .map_err(|err| ModuleError::Call {
                function,
                message: format!("{err:#}"),
            })?;

        tracing::trace!(%function, ?args, result, "called derivation function");
        Ok(result)
    }

    fn close(&self) -> Result<(), ModuleError> {
        if self.sandbox.lock().take().is_some() {
            tracing::debug!("derivation module released");
        }
        Ok(())
    }
}

impl fmt::Debug for DerivationModule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DerivationModule")
            .field("closed", &self.is_closed())
            .finish()
    }
}
