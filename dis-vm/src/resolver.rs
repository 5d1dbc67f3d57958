//! Module path resolution.
//!
//! The loader never touches the filesystem directly; it asks a
//! [`ModuleResolver`] chain for bytes given a path, the same separation the
//! reference runtime's `module_resolver.cpp` draws between "how module text
//! is found" and "how it's parsed".

use std::path::{Path, PathBuf};

/// Resolves a module path to its raw byte contents.
pub trait ModuleResolver {
    /// The error a failed resolution produces.
    type Error: core::fmt::Debug;

    /// Reads the bytes for `path`, or fails.
    fn resolve(&self, path: &str) -> Result<Vec<u8>, Self::Error>;
}

/// A single resolver's failure reason, used by [`FsResolver`] and threaded
/// through [`ResolverChain`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// No resolver in the chain could find the path.
    #[error("module not found: {0}")]
    NotFound(String),
    /// A resolver found the path but could not read it.
    #[error("failed to read module {path}: {message}")]
    Io {
        /// The path that failed to read.
        path: String,
        /// The underlying I/O error, rendered.
        message: String,
    },
}

/// Tries each resolver in order, falling through on [`ResolveError::NotFound`]
/// and stopping immediately on any other error — mirrors the reference
/// loader's probing-prefix fallthrough.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ModuleResolver<Error = ResolveError> + Send + Sync>>,
}

impl ResolverChain {
    /// An empty chain.
    pub fn new() -> ResolverChain {
        ResolverChain::default()
    }

    /// Appends a resolver, tried after every resolver already in the chain.
    pub fn push(&mut self, resolver: impl ModuleResolver<Error = ResolveError> + Send + Sync + 'static) {
        self.resolvers.push(Box::new(resolver));
    }
}

impl ModuleResolver for ResolverChain {
    type Error = ResolveError;

    fn resolve(&self, path: &str) -> Result<Vec<u8>, ResolveError> {
        for resolver in &self.resolvers {
            match resolver.resolve(path) {
                Ok(bytes) => return Ok(bytes),
                Err(ResolveError::NotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(ResolveError::NotFound(path.to_string()))
    }
}

/// Resolves module paths against files under a base directory. The `$self`
/// sentinel is handled by the caller (the VM hands back the entry module's
/// own bytes) before ever reaching a resolver.
pub struct FsResolver {
    base_dir: PathBuf,
}

impl FsResolver {
    /// A resolver rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> FsResolver {
        FsResolver {
            base_dir: base_dir.into(),
        }
    }
}

impl ModuleResolver for FsResolver {
    type Error = ResolveError;

    fn resolve(&self, path: &str) -> Result<Vec<u8>, ResolveError> {
        let full = self.base_dir.join(path);
        std::fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResolveError::NotFound(path.to_string())
            } else {
                ResolveError::Io {
                    path: path.to_string(),
                    message: e.to_string(),
                }
            }
        })
    }
}

/// The sentinel path referring to the module currently being loaded.
pub const SELF_SENTINEL: &str = "$self";

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticResolver(&'static str, &'static [u8]);

    impl ModuleResolver for StaticResolver {
        type Error = ResolveError;
        fn resolve(&self, path: &str) -> Result<Vec<u8>, ResolveError> {
            if path == self.0 {
                Ok(self.1.to_vec())
            } else {
                Err(ResolveError::NotFound(path.to_string()))
            }
        }
    }

    #[test]
    fn chain_falls_through_to_next_resolver() {
        let mut chain = ResolverChain::new();
        chain.push(StaticResolver("a.dis", b"AAA"));
        chain.push(StaticResolver("b.dis", b"BBB"));
        assert_eq!(chain.resolve("b.dis").unwrap(), b"BBB");
    }

    #[test]
    fn chain_reports_not_found_when_exhausted() {
        let chain = ResolverChain::new();
        assert!(matches!(chain.resolve("missing.dis"), Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn fs_resolver_reads_relative_to_base_dir() {
        let dir = std::env::temp_dir().join(format!("dis-vm-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("m.dis"), b"MODULE").unwrap();
        let resolver = FsResolver::new(&dir);
        assert_eq!(resolver.resolve("m.dis").unwrap(), b"MODULE");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fs_resolver_missing_file_is_not_found() {
        let resolver = FsResolver::new(Path::new("/nonexistent-dis-vm-base"));
        assert!(matches!(resolver.resolve("x.dis"), Err(ResolveError::NotFound(_))));
    }
}
