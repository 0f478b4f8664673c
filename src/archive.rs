use std::{collections::BTreeMap, io::Write};

use flate2::{Compression, GzBuilder};

use crate::{ignore::Rules, util::join_path};

// fixed gzip header fields, preserved by convention on every served archive
const GZIP_EXTRA: &[u8] = b"+aHR0cHM6Ly95b3V0dS5iZS96OVV6MWljandyTQo=";
const GZIP_COMMENT: &str = "Helm";

/// A file belonging to a chart package.
#[derive(Debug, Clone)]
pub struct PackageFile {
    /// The path of the file relative to the chart root
    pub path: String,
    /// The file contents
    pub data: Vec<u8>,
}

/// A chart package ready to be archived: the chart tree at a specific
/// commit, its ignore rules, and the archives of its resolved dependencies.
#[derive(Debug)]
pub struct Package {
    name: String,
    rules: Rules,
    files: Vec<PackageFile>,
    dependencies: BTreeMap<String, Vec<u8>>,
}

impl Package {
    /// Returns a new package rooted at `name`.
    pub fn new(
        name: String,
        rules: Rules,
        files: Vec<PackageFile>,
        dependencies: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Package {
            name,
            rules,
            files,
            dependencies,
        }
    }

    /// Returns the package base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Streams the package as a gzip-compressed tar archive. Dependency
    /// archives are placed under `<name>/charts/`, followed by every chart
    /// file not rejected by the ignore rules.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), errors::ArchiveError> {
        let encoder = GzBuilder::new()
            .extra(GZIP_EXTRA)
            .comment(GZIP_COMMENT)
            .write(writer, Compression::best());
        let mut builder = tar::Builder::new(encoder);

        for (name, data) in &self.dependencies {
            append_file(
                &mut builder,
                &join_path([self.name.as_str(), "charts", name.as_str()]),
                data,
            )?;
        }

        'files: for file in &self.files {
            if self.rules.ignore(&file.path, false) {
                continue;
            }
            // a file is also skipped when any ancestor directory is ignored
            if let Some((dir, _)) = file.path.rsplit_once('/') {
                let mut prefix = String::new();
                for component in dir.split('/') {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(component);
                    if self.rules.ignore(&prefix, true) {
                        continue 'files;
                    }
                }
            }

            append_file(
                &mut builder,
                &join_path([self.name.as_str(), file.path.as_str()]),
                &file.data,
            )?;
        }

        builder.into_inner()?.finish()?;

        Ok(())
    }

    /// Renders the archive into a byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, errors::ArchiveError> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o755);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)
}

/// Errors that can occur when writing archives
pub mod errors {
    use thiserror::Error;

    /// Errors that can occur when writing an archive
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum ArchiveError {
        /// The archive could not be written
        #[error("error writing archive")]
        Io(#[from] std::io::Error),
    }
}
