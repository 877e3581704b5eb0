//! Test file loading
//!
//! The engine does not interpret file contents. A [`FileLoader`] turns one
//! path into test registrations; what the file means is up to the embedder.

use std::path::Path;

use crate::error::LoadError;
use crate::queue::Registrar;

/// Registers the tests defined by one file.
pub trait FileLoader {
    fn load(&self, path: &Path, tests: &mut Registrar) -> Result<(), LoadError>;
}

impl<F> FileLoader for F
where
    F: Fn(&Path, &mut Registrar) -> Result<(), LoadError>,
{
    fn load(&self, path: &Path, tests: &mut Registrar) -> Result<(), LoadError> {
        self(path, tests)
    }
}

/// Read a test file to a string, for loaders that parse their input.
pub fn read_source(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}
