//! Instance port allocation.

use crate::error::{ExecError, ExecResult};
use clonedb_core::InstanceId;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use tokio::sync::Mutex;

/// Hands out ports from a fixed range, one per live instance.
///
/// Choosing a port and recording the reservation happen under one lock, so
/// two concurrent allocations can never return the same port. A reservation
/// stays until it is released, whether or not a process is listening yet.
pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_bind: bool,
    state: Mutex<PortState>,
}

struct PortState {
    reserved: HashMap<u16, InstanceId>,
    cursor: u16,
}

impl PortAllocator {
    /// Create an allocator for the inclusive range `start..=end`.
    ///
    /// Candidate ports are bind-probed on 127.0.0.1 so ports held by
    /// unrelated processes are skipped.
    pub fn new(start: u16, end: u16) -> ExecResult<Self> {
        if start == 0 || start > end {
            return Err(ExecError::Config(format!("empty port range {start}-{end}")));
        }
        Ok(Self {
            start,
            end,
            probe_bind: true,
            state: Mutex::new(PortState {
                reserved: HashMap::new(),
                cursor: start,
            }),
        })
    }

    /// Disable the bind probe. Reservations alone decide availability.
    pub fn without_bind_probe(mut self) -> Self {
        self.probe_bind = false;
        self
    }

    /// Reserve a free port for an instance.
    pub async fn reserve(&self, instance_id: InstanceId) -> ExecResult<u16> {
        let mut state = self.state.lock().await;
        let span = u32::from(self.end - self.start) + 1;

        for _ in 0..span {
            let candidate = state.cursor;
            state.cursor = if candidate == self.end {
                self.start
            } else {
                candidate + 1
            };

            if state.reserved.contains_key(&candidate) {
                continue;
            }
            if self.probe_bind && !port_is_bindable(candidate) {
                tracing::debug!(port = candidate, "Port in use outside clonedb, skipping");
                continue;
            }

            state.reserved.insert(candidate, instance_id);
            tracing::debug!(port = candidate, instance_id = %instance_id, "Port reserved");
            return Ok(candidate);
        }

        Err(ExecError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Record a reservation that already exists on the host (after a restart).
    pub async fn restore(&self, port: u16, instance_id: InstanceId) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.reserved.insert(port, instance_id)
            && previous != instance_id
        {
            tracing::warn!(
                port = port,
                instance_id = %instance_id,
                previous = %previous,
                "Port claimed by two instances on disk"
            );
        }
    }

    /// Release every port held by an instance.
    pub async fn release(&self, instance_id: InstanceId) {
        let mut state = self.state.lock().await;
        state.reserved.retain(|_, owner| *owner != instance_id);
    }

    /// Ports currently reserved, ascending.
    pub async fn reserved_ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        let mut ports: Vec<u16> = state.reserved.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
