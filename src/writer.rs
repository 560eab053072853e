use std::{
    fs::File,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use crate::mode::PathType;

/// Backing store for a cassette. One writer per cassette; the cassette lock
/// serializes every append.
pub trait CassetteWriter: Send + Sync + std::fmt::Debug {
    fn append(&mut self, fragment: &str) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    fn name(&self) -> &str;
    fn path_type(&self) -> PathType;
    fn read_only(&self) -> bool;
}

/// Append-only file writer.
#[derive(Debug)]
pub struct FileWriter {
    file: Option<File>,
    name: String,
}

impl FileWriter {
    pub fn new(file: File, path: impl AsRef<Path>) -> Self {
        Self {
            file: Some(file),
            name: path.as_ref().display().to_string(),
        }
    }

    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::new(file, path))
    }
}

impl CassetteWriter for FileWriter {
    fn append(&mut self, fragment: &str) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(fragment.as_bytes()),
            None => Ok(()),
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path_type(&self) -> PathType {
        PathType::File
    }

    fn read_only(&self) -> bool {
        false
    }
}

/// A writer that only carries a name. Cassettes loaded from a file keep the
/// file's path reportable while silently discarding writes.
#[derive(Debug)]
pub struct NamedPlaceholder {
    path_type: PathType,
    name: String,
}

impl NamedPlaceholder {
    pub fn new(path_type: PathType, name: impl Into<String>) -> Self {
        Self {
            path_type,
            name: name.into(),
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::new(PathType::File, PathBuf::from(path.as_ref()).display().to_string())
    }
}

impl CassetteWriter for NamedPlaceholder {
    fn append(&mut self, _fragment: &str) -> io::Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path_type(&self) -> PathType {
        self.path_type
    }

    fn read_only(&self) -> bool {
        true
    }
}
