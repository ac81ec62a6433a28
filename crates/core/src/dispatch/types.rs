//! Types for storage dispatch.

use serde::Serialize;
use std::path::{Path, PathBuf};

use super::config::StorageMode;
use crate::download::DownloadArtifact;
use crate::planner::Season;

/// One artifact to place, plus where it belongs.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub artifact: DownloadArtifact,
    pub quadrant_id: String,
    pub year: i32,
    pub season: Season,
    /// Extra files that travel with the artifact (metadata, masks).
    pub sidecars: Vec<PathBuf>,
}

impl DispatchRequest {
    pub fn new(artifact: DownloadArtifact, quadrant_id: &str, year: i32, season: Season) -> Self {
        Self {
            artifact,
            quadrant_id: quadrant_id.to_string(),
            year,
            season,
            sidecars: Vec::new(),
        }
    }

    pub fn with_sidecars(mut self, sidecars: Vec<PathBuf>) -> Self {
        self.sidecars = sidecars;
        self
    }

    /// `<quadrant>/<year>/<season>` components, relative to the storage root.
    pub fn relative_components(&self) -> [String; 3] {
        [
            self.quadrant_id.clone(),
            self.year.to_string(),
            self.season.as_str().to_string(),
        ]
    }

    pub fn relative_dir(&self) -> PathBuf {
        self.relative_components().iter().collect()
    }

    /// The artifact followed by its sidecars.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.artifact.path.as_path()).chain(self.sidecars.iter().map(|p| p.as_path()))
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub mode: StorageMode,
    /// Final location of the artifact (a local path or `host:/path`).
    pub destination: String,
    /// Number of files placed, artifact included.
    pub files: usize,
    pub bytes: u64,
}

/// Files in the artifact's directory named `<image_id>.*`, other than the artifact itself.
///
/// In-progress `.part` files are never picked up.
pub async fn collect_sidecars(artifact: &Path, image_id: &str) -> std::io::Result<Vec<PathBuf>> {
    let Some(dir) = artifact.parent() else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", image_id);
    let mut sidecars = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == artifact || !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && !name.ends_with(".part") {
            sidecars.push(path);
        }
    }
    sidecars.sort();
    Ok(sidecars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(path: PathBuf) -> DownloadArtifact {
        DownloadArtifact {
            image_id: "20210315_160512_1040".to_string(),
            path,
            bytes: 3,
            md5: String::new(),
            verified: true,
        }
    }

    #[test]
    fn test_relative_dir() {
        let request = DispatchRequest::new(
            artifact(PathBuf::from("/staging/B27/x.tif")),
            "B27",
            2021,
            Season::Secas,
        );
        assert_eq!(request.relative_dir(), PathBuf::from("B27/2021/secas"));
        assert_eq!(request.files().count(), 1);
    }

    #[tokio::test]
    async fn test_collect_sidecars() {
        let dir = TempDir::new().unwrap();
        let id = "20210315_160512_1040";
        let main = dir.path().join(format!("{id}.tif"));
        tokio::fs::write(&main, b"tif").await.unwrap();
        tokio::fs::write(dir.path().join(format!("{id}.xml")), b"<x/>").await.unwrap();
        tokio::fs::write(dir.path().join(format!("{id}_udm2.tif")), b"u").await.unwrap();
        tokio::fs::write(dir.path().join("other.xml.part"), b"p").await.unwrap();
        tokio::fs::write(dir.path().join(format!("{id}.json.part")), b"p").await.unwrap();

        let sidecars = collect_sidecars(&main, id).await.unwrap();
        assert_eq!(sidecars, vec![dir.path().join(format!("{id}.xml"))]);
    }
}
