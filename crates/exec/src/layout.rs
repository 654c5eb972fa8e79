//! On-disk layout of the executor's data root.
//!
//! ```text
//! <root>/image_uploads/<image_id>             writable upload subvolume
//! <root>/image_uploads/<image_id>.anonymised  finalise script has run
//! <root>/images/<image_id>                    read-only finalised image
//! <root>/instances/<instance_id>              writable instance snapshot
//! <root>/instances/<instance_id>.json         instance sidecar
//! <root>/instances/<instance_id>.log          database process output
//! ```

use crate::error::ExecResult;
use clonedb_core::{ImageId, InstanceId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const UPLOADS_DIR: &str = "image_uploads";
const IMAGES_DIR: &str = "images";
const INSTANCES_DIR: &str = "instances";

/// Paths under the data root.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the top-level directories.
    pub async fn ensure(&self) -> ExecResult<()> {
        for dir in self.top_level_dirs() {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn top_level_dirs(&self) -> [PathBuf; 3] {
        [UPLOADS_DIR, IMAGES_DIR, INSTANCES_DIR].map(|dir| self.root.join(dir))
    }

    pub fn upload_dir(&self, image_id: ImageId) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(image_id.to_string())
    }

    pub fn anonymised_marker(&self, image_id: ImageId) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join(format!("{image_id}.anonymised"))
    }

    pub fn anonymisation_script(&self, image_id: ImageId) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join(format!("{image_id}.anonymisation"))
    }

    pub fn image_dir(&self, image_id: ImageId) -> PathBuf {
        self.root.join(IMAGES_DIR).join(image_id.to_string())
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    pub fn instance_dir(&self, instance_id: InstanceId) -> PathBuf {
        self.instances_dir().join(instance_id.to_string())
    }

    pub fn sidecar(&self, instance_id: InstanceId) -> PathBuf {
        self.instances_dir().join(format!("{instance_id}.json"))
    }

    pub fn log_file(&self, instance_id: InstanceId) -> PathBuf {
        self.instances_dir().join(format!("{instance_id}.log"))
    }
}

/// Host-side record of a live instance, written next to its snapshot.
///
/// Lets the executor find an image's dependents, restore port reservations
/// and stop processes started before a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub image_id: ImageId,
    pub port: u16,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Sidecar {
    pub async fn read(path: &Path) -> ExecResult<Option<Self>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see a partial file.
    pub async fn write(&self, path: &Path) -> ExecResult<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(self)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// All sidecars on disk, ascending by instance id.
pub async fn read_sidecars(layout: &Layout) -> ExecResult<Vec<(InstanceId, Sidecar)>> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(layout.instances_dir()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(instance_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| InstanceId::parse(s).ok())
        else {
            continue;
        };
        match Sidecar::read(&path).await {
            Ok(Some(sidecar)) => found.push((instance_id, sidecar)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable instance sidecar");
            }
        }
    }

    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> ExecResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
