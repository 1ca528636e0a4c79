// src/artifacts.rs

use crate::metrics::FilterName;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Log files written by ffmpeg during one run, removed when dropped unless
/// they should be kept for debugging.
#[derive(Debug)]
pub struct ArtifactSet {
    paths: BTreeMap<FilterName, PathBuf>,
    keep: bool,
}

impl ArtifactSet {
    /// Allocates paths in `dir` for every filter that writes a log file.
    ///
    /// Names embed both input file names, so comparisons of different pairs
    /// can share a directory.
    pub fn new(dir: &Path, reference: &Path, distorted: &Path, keep: bool) -> Self {
        let ref_name = file_name(reference);
        let dist_name = file_name(distorted);

        let paths = [FilterName::Psnr, FilterName::Ssim, FilterName::Libvmaf]
            .into_iter()
            .map(|filter| {
                let suffix = if filter == FilterName::Libvmaf { "json" } else { "txt" };
                let path = dir.join(format!("ffqm_{}_{}_{}.{}", filter, ref_name, dist_name, suffix));
                debug!("Writing temporary {} information to: {}", filter, path.display());
                (filter, path)
            })
            .collect();

        ArtifactSet { paths, keep }
    }

    pub fn path(&self, filter: FilterName) -> Option<&Path> {
        self.paths.get(&filter).map(PathBuf::as_path)
    }

    fn cleanup(&self) {
        for path in self.paths.values() {
            if !path.is_file() {
                continue;
            }
            if self.keep {
                debug!("Keeping temp file {}", path.display());
            } else if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove temporary file {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}
