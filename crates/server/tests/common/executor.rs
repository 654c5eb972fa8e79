//! In-memory executor double that records every call.

use async_trait::async_trait;
use clonedb_core::{ImageId, InstanceId};
use clonedb_exec::{ExecError, ExecResult, Executor, PortAllocator};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Executor operations, for call logs and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    CreateSubvolume,
    FinaliseImage,
    DestroySubvolume,
    CreateInstance,
    DestroyInstance,
}

/// One recorded executor call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateSubvolume(ImageId),
    FinaliseImage(ImageId, Vec<u8>),
    DestroySubvolume(ImageId),
    CreateInstance(ImageId, InstanceId),
    DestroyInstance(InstanceId),
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::CreateSubvolume(_) => Op::CreateSubvolume,
            Call::FinaliseImage(..) => Op::FinaliseImage,
            Call::DestroySubvolume(_) => Op::DestroySubvolume,
            Call::CreateInstance(..) => Op::CreateInstance,
            Call::DestroyInstance(_) => Op::DestroyInstance,
        }
    }
}

#[derive(Default)]
struct HostState {
    uploads: HashSet<ImageId>,
    images: HashSet<ImageId>,
    instances: HashMap<InstanceId, ImageId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Target {
    Image(ImageId),
    Instance(InstanceId),
}

/// Executor that keeps host state in memory.
///
/// Mirrors the host executor's observable behaviour: finalise is idempotent,
/// subvolume destroy refuses while instances exist, instance destroy reports
/// `NotFound` for unknown ids. Also detects overlapping calls for one id.
#[allow(dead_code)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    state: Mutex<HostState>,
    failing: Mutex<HashSet<Op>>,
    failing_instances: Mutex<HashSet<InstanceId>>,
    in_flight: Mutex<HashSet<Target>>,
    overlaps: AtomicUsize,
    ports: PortAllocator,
    fixed_port: Option<u16>,
    delay: Option<Duration>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(HostState::default()),
            failing: Mutex::new(HashSet::new()),
            failing_instances: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            ports: PortAllocator::new(42000, 42999)
                .expect("valid port range")
                .without_bind_probe(),
            fixed_port: None,
            delay: None,
        }
    }

    /// Return this port from every `create_instance`.
    pub fn with_fixed_port(mut self, port: u16) -> Self {
        self.fixed_port = Some(port);
        self
    }

    /// Sleep inside every call, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every call of `op` fail until cleared.
    pub fn fail(&self, op: Op) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Make `destroy_instance` fail for one instance until cleared.
    pub fn fail_instance(&self, instance_id: InstanceId) {
        self.failing_instances.lock().unwrap().insert(instance_id);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
        self.failing_instances.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|call| call.op() == op).count()
    }

    /// Number of calls that started while another call on the same id ran.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn has_upload(&self, image_id: ImageId) -> bool {
        self.state.lock().unwrap().uploads.contains(&image_id)
    }

    pub fn has_image(&self, image_id: ImageId) -> bool {
        self.state.lock().unwrap().images.contains(&image_id)
    }

    pub fn has_instance(&self, instance_id: InstanceId) -> bool {
        self.state.lock().unwrap().instances.contains_key(&instance_id)
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.ports.reserved_ports().await
    }

    async fn begin(&self, call: Call, target: Target) -> ExecResult<InFlight<'_>> {
        let op = call.op();
        self.calls.lock().unwrap().push(call);

        if !self.in_flight.lock().unwrap().insert(target) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let guard = InFlight {
            executor: self,
            target,
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&op) {
            return Err(ExecError::CommandFailed {
                command: format!("{op:?}"),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(guard)
    }
}

struct InFlight<'a> {
    executor: &'a RecordingExecutor,
    target: Target,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.executor
            .in_flight
            .lock()
            .unwrap()
            .remove(&self.target);
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn create_subvolume(&self, image_id: ImageId) -> ExecResult<()> {
        let _guard = self
            .begin(Call::CreateSubvolume(image_id), Target::Image(image_id))
            .await?;

        let mut state = self.state.lock().unwrap();
        if state.uploads.contains(&image_id) || state.images.contains(&image_id) {
            return Err(ExecError::AlreadyExists(format!("image {image_id}")));
        }
        state.uploads.insert(image_id);
        Ok(())
    }

    async fn finalise_image(&self, image_id: ImageId, anonymisation_script: &[u8]) -> ExecResult<()> {
        let _guard = self
            .begin(
                Call::FinaliseImage(image_id, anonymisation_script.to_vec()),
                Target::Image(image_id),
            )
            .await?;

        let mut state = self.state.lock().unwrap();
        if state.images.contains(&image_id) {
            return Ok(());
        }
        if !state.uploads.remove(&image_id) {
            return Err(ExecError::NotFound(format!("upload for image {image_id}")));
        }
        state.images.insert(image_id);
        Ok(())
    }

    async fn destroy_subvolume(&self, image_id: ImageId) -> ExecResult<()> {
        let _guard = self
            .begin(Call::DestroySubvolume(image_id), Target::Image(image_id))
            .await?;

        let mut state = self.state.lock().unwrap();
        let mut instances: Vec<InstanceId> = state
            .instances
            .iter()
            .filter(|(_, parent)| **parent == image_id)
            .map(|(id, _)| *id)
            .collect();
        if !instances.is_empty() {
            instances.sort_unstable();
            return Err(ExecError::InUse {
                image_id,
                instances,
            });
        }
        state.uploads.remove(&image_id);
        state.images.remove(&image_id);
        Ok(())
    }

    async fn create_instance(&self, image_id: ImageId, instance_id: InstanceId) -> ExecResult<u16> {
        let _guard = self
            .begin(
                Call::CreateInstance(image_id, instance_id),
                Target::Instance(instance_id),
            )
            .await?;

        if !self.has_image(image_id) {
            return Err(ExecError::NotFound(format!("image {image_id}")));
        }
        let port = match self.fixed_port {
            Some(port) => port,
            None => self.ports.reserve(instance_id).await?,
        };
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance_id, image_id);
        Ok(port)
    }

    async fn destroy_instance(&self, instance_id: InstanceId) -> ExecResult<()> {
        let _guard = self
            .begin(
                Call::DestroyInstance(instance_id),
                Target::Instance(instance_id),
            )
            .await?;

        if self.failing_instances.lock().unwrap().contains(&instance_id) {
            return Err(ExecError::StartupFailed(format!(
                "injected stop failure for instance {instance_id}"
            )));
        }
        if self
            .state
            .lock()
            .unwrap()
            .instances
            .remove(&instance_id)
            .is_none()
        {
            return Err(ExecError::NotFound(format!("instance {instance_id}")));
        }
        self.ports.release(instance_id).await;
        Ok(())
    }

    async fn health_check(&self) -> ExecResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}
