//! Host executor: subvolumes on the local filesystem and database processes
//! on loopback ports.

use crate::driver::SubvolumeDriver;
use crate::error::{ExecError, ExecResult};
use crate::executor::Executor;
use crate::layout::{Layout, Sidecar, read_sidecars, remove_file_if_exists};
use crate::ports::PortAllocator;
use crate::process::{
    run_with_timeout, stderr_excerpt, stop_child, stop_pid, wait_until_ready,
};
use async_trait::async_trait;
use clonedb_core::config::ExecutorConfig;
use clonedb_core::{ImageId, InstanceId};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::instrument;

/// Exit status a provisioning script uses for "not a valid data directory".
pub const INVALID_DATA_DIRECTORY_EXIT: i32 = 3;

/// Executor backed by the local host.
pub struct HostExecutor {
    config: ExecutorConfig,
    layout: Layout,
    driver: SubvolumeDriver,
    ports: PortAllocator,
    children: Mutex<HashMap<InstanceId, Child>>,
}

impl HostExecutor {
    /// Create the executor, preparing the data root and restoring port
    /// reservations for instances already on disk.
    pub async fn new(config: ExecutorConfig) -> ExecResult<Self> {
        config.validate().map_err(ExecError::Config)?;

        let layout = Layout::new(&config.root);
        layout.ensure().await?;

        let ports = PortAllocator::new(config.port_range_start, config.port_range_end)?;
        let existing = read_sidecars(&layout).await?;
        for (instance_id, sidecar) in &existing {
            ports.restore(sidecar.port, *instance_id).await;
        }
        if !existing.is_empty() {
            tracing::info!(
                count = existing.len(),
                "Restored port reservations for instances on disk"
            );
        }

        Ok(Self {
            driver: SubvolumeDriver::from(config.driver),
            config,
            layout,
            ports,
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Run the configured finalise script once per upload.
    async fn anonymise(&self, image_id: ImageId, script: &[u8]) -> ExecResult<()> {
        let marker = self.layout.anonymised_marker(image_id);
        if fs::try_exists(&marker).await? {
            tracing::debug!(image_id = %image_id, "Upload already anonymised");
            return Ok(());
        }

        if let Some(finalise_script) = &self.config.finalise_script {
            let script_path = self.layout.anonymisation_script(image_id);
            fs::write(&script_path, script).await?;

            let upload = self.layout.upload_dir(image_id);
            let result = run_with_timeout(
                finalise_script.as_os_str(),
                [upload.as_os_str(), script_path.as_os_str()],
                self.config.script_timeout(),
            )
            .await;
            remove_file_if_exists(&script_path).await?;

            let output = result?;
            if !output.status.success() {
                return Err(ExecError::CommandFailed {
                    command: finalise_script.display().to_string(),
                    status: output.status.code(),
                    stderr: stderr_excerpt(&output),
                });
            }
        } else {
            tracing::warn!(
                image_id = %image_id,
                "No finalise_script configured, sealing upload without anonymisation"
            );
        }

        fs::write(&marker, b"").await?;
        Ok(())
    }

    /// Everything after the port is reserved. Cleanup on failure is the
    /// caller's job.
    async fn start_instance(
        &self,
        image_id: ImageId,
        instance_id: InstanceId,
        port: u16,
        child_slot: &mut Option<Child>,
    ) -> ExecResult<()> {
        let data_dir = self.layout.instance_dir(instance_id);
        let sidecar_path = self.layout.sidecar(instance_id);

        self.driver
            .snapshot(&self.layout.image_dir(image_id), &data_dir, false)
            .await?;

        let mut sidecar = Sidecar {
            image_id,
            port,
            pid: None,
        };
        sidecar.write(&sidecar_path).await?;

        if let Some(script) = &self.config.provision_script {
            let port_arg = port.to_string();
            let output = run_with_timeout(
                script.as_os_str(),
                [data_dir.as_os_str(), std::ffi::OsStr::new(&port_arg)],
                self.config.script_timeout(),
            )
            .await?;
            match output.status.code() {
                Some(0) => {}
                Some(INVALID_DATA_DIRECTORY_EXIT) => {
                    return Err(ExecError::InvalidDataDirectory(format!(
                        "{}: {}",
                        data_dir.display(),
                        stderr_excerpt(&output)
                    )));
                }
                code => {
                    return Err(ExecError::StartupFailed(format!(
                        "provision script exited with {code:?}: {}",
                        stderr_excerpt(&output)
                    )));
                }
            }
        }

        let argv = render_command(&self.config.server_command, &data_dir, port);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::Config("server_command is empty".to_string()))?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.log_file(instance_id))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| ExecError::StartupFailed(format!("failed to spawn {program}: {e}")))?;

        sidecar.pid = child.id();
        let child = child_slot.insert(child);
        sidecar.write(&sidecar_path).await?;

        wait_until_ready(child, port, self.config.ready_timeout()).await
    }

    /// Undo a partially created instance. Errors are logged, not returned,
    /// so the original failure reaches the caller.
    async fn cleanup_instance(&self, instance_id: InstanceId, child: Option<Child>) {
        if let Some(mut child) = child
            && let Err(e) = stop_child(&mut child, self.config.stop_grace()).await
        {
            tracing::error!(instance_id = %instance_id, error = %e, "Failed to stop process during cleanup");
        }
        if let Err(e) = self.driver.delete(&self.layout.instance_dir(instance_id)).await {
            tracing::error!(instance_id = %instance_id, error = %e, "Failed to delete snapshot during cleanup");
        }
        for path in [
            self.layout.sidecar(instance_id),
            self.layout.log_file(instance_id),
        ] {
            if let Err(e) = remove_file_if_exists(&path).await {
                tracing::error!(path = %path.display(), error = %e, "Failed to remove file during cleanup");
            }
        }
        self.ports.release(instance_id).await;
    }
}

/// Substitute `{data_dir}` and `{port}` in the server argv template.
fn render_command(template: &[String], data_dir: &std::path::Path, port: u16) -> Vec<String> {
    let data_dir = data_dir.display().to_string();
    let port = port.to_string();
    template
        .iter()
        .map(|arg| arg.replace("{data_dir}", &data_dir).replace("{port}", &port))
        .collect()
}

#[async_trait]
impl Executor for HostExecutor {
    #[instrument(skip(self), fields(backend = "host"))]
    async fn create_subvolume(&self, image_id: ImageId) -> ExecResult<()> {
        self.driver.create(&self.layout.upload_dir(image_id)).await?;
        tracing::info!("Upload subvolume created");
        Ok(())
    }

    #[instrument(skip(self, anonymisation_script), fields(backend = "host"))]
    async fn finalise_image(
        &self,
        image_id: ImageId,
        anonymisation_script: &[u8],
    ) -> ExecResult<()> {
        let upload = self.layout.upload_dir(image_id);
        let image = self.layout.image_dir(image_id);

        if fs::try_exists(&image).await? {
            // A previous attempt sealed the image but may not have removed the upload.
            self.driver.delete(&upload).await?;
            remove_file_if_exists(&self.layout.anonymised_marker(image_id)).await?;
            tracing::info!("Image already finalised");
            return Ok(());
        }
        if !fs::try_exists(&upload).await? {
            return Err(ExecError::NotFound(format!("upload for image {image_id}")));
        }

        self.anonymise(image_id, anonymisation_script).await?;
        self.driver.snapshot(&upload, &image, true).await?;
        self.driver.delete(&upload).await?;
        remove_file_if_exists(&self.layout.anonymised_marker(image_id)).await?;

        tracing::info!("Image finalised");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "host"))]
    async fn destroy_subvolume(&self, image_id: ImageId) -> ExecResult<()> {
        let dependents: Vec<InstanceId> = read_sidecars(&self.layout)
            .await?
            .into_iter()
            .filter(|(_, sidecar)| sidecar.image_id == image_id)
            .map(|(id, _)| id)
            .collect();
        if !dependents.is_empty() {
            return Err(ExecError::InUse {
                image_id,
                instances: dependents,
            });
        }

        self.driver.delete(&self.layout.image_dir(image_id)).await?;
        self.driver.delete(&self.layout.upload_dir(image_id)).await?;
        remove_file_if_exists(&self.layout.anonymised_marker(image_id)).await?;
        remove_file_if_exists(&self.layout.anonymisation_script(image_id)).await?;

        tracing::info!("Image subvolumes deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "host"))]
    async fn create_instance(&self, image_id: ImageId, instance_id: InstanceId) -> ExecResult<u16> {
        if !fs::try_exists(self.layout.image_dir(image_id)).await? {
            return Err(ExecError::NotFound(format!("finalised image {image_id}")));
        }
        if fs::try_exists(self.layout.sidecar(instance_id)).await?
            || fs::try_exists(self.layout.instance_dir(instance_id)).await?
        {
            return Err(ExecError::AlreadyExists(format!("instance {instance_id}")));
        }

        let port = self.ports.reserve(instance_id).await?;
        let mut child = None;

        match self
            .start_instance(image_id, instance_id, port, &mut child)
            .await
        {
            Ok(()) => {
                if let Some(child) = child {
                    self.children.lock().await.insert(instance_id, child);
                }
                tracing::info!(port = port, "Instance ready");
                Ok(port)
            }
            Err(e) => {
                tracing::warn!(port = port, error = %e, "Instance start failed, cleaning up");
                self.cleanup_instance(instance_id, child).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(backend = "host"))]
    async fn destroy_instance(&self, instance_id: InstanceId) -> ExecResult<()> {
        let data_dir = self.layout.instance_dir(instance_id);
        let sidecar_path = self.layout.sidecar(instance_id);
        let sidecar = Sidecar::read(&sidecar_path).await?;
        let child = self.children.lock().await.remove(&instance_id);

        if sidecar.is_none() && child.is_none() && !fs::try_exists(&data_dir).await? {
            return Err(ExecError::NotFound(format!("instance {instance_id}")));
        }

        let grace = self.config.stop_grace();
        match (child, sidecar.as_ref().and_then(|s| s.pid)) {
            (Some(mut child), _) => stop_child(&mut child, grace).await?,
            (None, Some(pid)) => stop_pid(pid, &data_dir, grace).await?,
            (None, None) => {}
        }

        self.driver.delete(&data_dir).await?;
        remove_file_if_exists(&sidecar_path).await?;
        remove_file_if_exists(&self.layout.log_file(instance_id)).await?;
        self.ports.release(instance_id).await;

        tracing::info!("Instance destroyed");
        Ok(())
    }

    async fn health_check(&self) -> ExecResult<()> {
        for dir in self.layout.top_level_dirs() {
            match fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(ExecError::Config(format!(
                        "{} is not a directory",
                        dir.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.driver.name()
    }
}
