// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::format::FormatVersion;
use crate::error::Error;
use std::path::{Path, PathBuf};

/// Per-store monotone sorted table number
pub type Generation = u32;

/// One file of a sorted table's file set
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Component {
    /// Rows in partition order
    Data,

    /// Partition key → data offset (+ promoted row index offset)
    Index,

    /// Sparse sample of the index
    Summary,

    /// Bloom filter over partition keys
    Filter,

    /// Statistics sidecar
    Statistics,

    /// Plain-text list of the set's components; written last, so its
    /// presence marks the set as committed
    Toc,
}

impl Component {
    pub const ALL: [Self; 6] = [
        Self::Data,
        Self::Index,
        Self::Summary,
        Self::Filter,
        Self::Statistics,
        Self::Toc,
    ];

    #[must_use]
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Data => "Data.db",
            Self::Index => "Index.db",
            Self::Summary => "Summary.db",
            Self::Filter => "Filter.db",
            Self::Statistics => "Statistics.db",
            Self::Toc => "TOC.txt",
        }
    }

    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.file_suffix() == suffix)
    }
}

/// Identity of one immutable sorted table file set
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    /// Keyspace the table belongs to
    pub keyspace: String,

    /// Table name, used as file name prefix
    pub table: String,

    /// Per-store monotone generation number
    pub generation: Generation,

    /// On-disk format version of the set
    pub version: FormatVersion,

    /// Directory holding the file set
    pub directory: PathBuf,
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}-{}({})",
            self.keyspace, self.table, self.generation, self.version,
        )
    }
}

impl Descriptor {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(
        keyspace: &str,
        table: &str,
        generation: Generation,
        version: FormatVersion,
        directory: P,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            generation,
            version,
            directory: directory.into(),
        }
    }

    #[must_use]
    pub fn filename(&self, component: Component) -> String {
        format!(
            "{}-{}-{}",
            self.table,
            self.generation,
            component.file_suffix(),
        )
    }

    #[must_use]
    pub fn path(&self, component: Component) -> PathBuf {
        self.directory.join(self.filename(component))
    }

    /// Writes the TOC, committing the file set.
    ///
    /// First line is the format version, remaining lines are component
    /// suffixes.
    pub fn write_toc(&self) -> crate::Result<()> {
        let mut content = String::new();
        content.push_str(self.version.as_str());
        content.push('\n');

        for component in Component::ALL {
            if component != Component::Toc {
                content.push_str(component.file_suffix());
                content.push('\n');
            }
        }

        crate::file::rewrite_atomic(&self.path(Component::Toc), content.as_bytes())?;
        Ok(())
    }

    /// Returns `true` if every component listed in the TOC exists.
    pub fn is_complete(&self) -> crate::Result<bool> {
        let toc_path = self.path(Component::Toc);

        if !toc_path.try_exists()? {
            return Ok(false);
        }

        let content = std::fs::read_to_string(&toc_path)?;

        for line in content.lines().skip(1) {
            let Some(component) = Component::from_suffix(line.trim()) else {
                log::warn!("unknown component {line:?} in {toc_path:?}");
                return Ok(false);
            };

            if !self.path(component).try_exists()? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Removes every file of the set. Missing files are ignored.
    pub fn delete_files(&self) {
        for component in Component::ALL {
            let path = self.path(component);

            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!("failed to delete {path:?}: {e}");
                }
            }
        }
    }

    /// Scans a directory for committed sorted table sets of the given table.
    ///
    /// Incomplete sets (no TOC, or TOC referencing missing files) are
    /// rejected and their leftovers deleted.
    pub fn discover(
        directory: &Path,
        keyspace: &str,
        table: &str,
    ) -> crate::Result<Vec<Self>> {
        let mut found = vec![];

        if !directory.try_exists()? {
            return Ok(found);
        }

        for dirent in std::fs::read_dir(directory)? {
            let dirent = dirent?;

            let file_name = dirent.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            let Some((prefix, generation)) = parse_toc_name(name, table) else {
                continue;
            };
            debug_assert_eq!(prefix, table);

            let toc_path = dirent.path();
            let content = std::fs::read_to_string(&toc_path)?;

            let Some(version_line) = content.lines().next() else {
                log::warn!("empty TOC {toc_path:?}, rejecting set");
                continue;
            };

            let version_bytes: [u8; 2] = version_line
                .trim()
                .as_bytes()
                .try_into()
                .map_err(|_| Error::InvalidVersion([0, 0]))?;

            let descriptor = Self::new(
                keyspace,
                table,
                generation,
                FormatVersion::parse(version_bytes)?,
                directory,
            );

            if descriptor.is_complete()? {
                found.push(descriptor);
            } else {
                log::warn!("rejecting incomplete sorted table set {descriptor}");
                descriptor.delete_files();
            }
        }

        found.sort_by_key(|d| d.generation);

        // Leftovers of uncommitted sets have no TOC at all; sweep them
        for dirent in std::fs::read_dir(directory)? {
            let dirent = dirent?;

            let file_name = dirent.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            if let Some(generation) = parse_component_name(name, table) {
                if !found.iter().any(|d| d.generation == generation) {
                    log::warn!("deleting orphaned file {name:?}");

                    if let Err(e) = std::fs::remove_file(dirent.path()) {
                        log::error!("failed to delete orphan {name:?}: {e}");
                    }
                }
            }
        }

        Ok(found)
    }
}

/// Parses `{table}-{generation}-TOC.txt`.
fn parse_toc_name<'a>(name: &'a str, table: &'a str) -> Option<(&'a str, Generation)> {
    let generation = parse_component_name(name, table)?;

    if name.ends_with(Component::Toc.file_suffix()) {
        Some((table, generation))
    } else {
        None
    }
}

/// Parses `{table}-{generation}-{suffix}` and returns the generation.
fn parse_component_name(name: &str, table: &str) -> Option<Generation> {
    let rest = name.strip_prefix(table)?.strip_prefix('-')?;
    let (generation, suffix) = rest.split_once('-')?;

    Component::from_suffix(suffix)?;
    generation.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn descriptor(dir: &Path) -> Descriptor {
        Descriptor::new("ks", "cf", 7, FormatVersion::CURRENT, dir)
    }

    #[test]
    fn descriptor_filenames() {
        let d = descriptor(Path::new("/tmp"));
        assert_eq!("cf-7-Data.db", d.filename(Component::Data));
        assert_eq!("cf-7-TOC.txt", d.filename(Component::Toc));
    }

    #[test]
    fn discover_rejects_incomplete_sets() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let d = descriptor(dir.path());

        // Create all components except Data
        for component in Component::ALL {
            if component == Component::Data || component == Component::Toc {
                continue;
            }
            std::fs::write(d.path(component), b"x")?;
        }
        d.write_toc()?;

        let found = Descriptor::discover(dir.path(), "ks", "cf")?;
        assert!(found.is_empty());

        // The leftovers have been swept
        assert!(!d.path(Component::Index).try_exists()?);

        Ok(())
    }

    #[test]
    fn discover_accepts_complete_sets() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let d = descriptor(dir.path());

        for component in Component::ALL {
            if component != Component::Toc {
                std::fs::write(d.path(component), b"x")?;
            }
        }
        d.write_toc()?;

        let found = Descriptor::discover(dir.path(), "ks", "cf")?;
        assert_eq!(1, found.len());
        assert_eq!(7, found.first().map(|d| d.generation).unwrap_or_default());

        Ok(())
    }

    #[test]
    fn discover_sweeps_orphans() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let d = descriptor(dir.path());

        // A data file without a TOC is an aborted write
        std::fs::write(d.path(Component::Data), b"x")?;

        let found = Descriptor::discover(dir.path(), "ks", "cf")?;
        assert!(found.is_empty());
        assert!(!d.path(Component::Data).try_exists()?);

        Ok(())
    }
}
