//! The capability that carries VM commands to local controllers.
//!
//! Every call is addressed by the control address of the local controller
//! that must act. [`HttpActuator`] posts JSON commands over HTTP/1;
//! [`SimulatedActuator`] accepts commands without contacting any host and
//! records them, for dry runs and tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde::Serialize;
use tracing::{debug, warn};

use hive_core::CapacityVector;
use hivegrid_state::VirtualMachineMetaData;

use crate::error::{ActuatorError, ActuatorResult};
use crate::request::MigrationRequest;

#[async_trait]
pub trait VirtualMachineActuator: Send + Sync {
    /// Ask the source controller to live-migrate a VM to the destination.
    async fn migrate_virtual_machine(
        &self,
        address: &str,
        request: &MigrationRequest,
    ) -> ActuatorResult<()>;

    async fn start(&self, address: &str, vm: &VirtualMachineMetaData) -> ActuatorResult<()>;

    async fn suspend(&self, address: &str, vm_id: &str) -> ActuatorResult<()>;

    async fn resume(&self, address: &str, vm_id: &str) -> ActuatorResult<()>;

    async fn shutdown(&self, address: &str, vm_id: &str) -> ActuatorResult<()>;

    async fn reboot(&self, address: &str, vm_id: &str) -> ActuatorResult<()>;

    async fn destroy(&self, address: &str, vm_id: &str) -> ActuatorResult<()>;

    async fn resize(
        &self,
        address: &str,
        vm_id: &str,
        capacity: &CapacityVector,
    ) -> ActuatorResult<()>;

    /// Whether the controller at `address` answers at all.
    async fn is_active(&self, address: &str) -> bool;
}

// ── HTTP ──────────────────────────────────────────────────────────

/// Posts commands to `http://{address}/virtual-machines/{id}/{command}`.
pub struct HttpActuator {
    request_timeout: Duration,
}

impl HttpActuator {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// POST a JSON body, bounded by the request timeout unless `bounded` is false.
    async fn post(
        &self,
        address: &str,
        path: &str,
        body: &impl Serialize,
        bounded: bool,
    ) -> ActuatorResult<()> {
        let payload = Bytes::from(serde_json::to_vec(body)?);
        let call = send(address, http::Method::POST, path, payload);
        let status = if bounded {
            tokio::time::timeout(self.request_timeout, call)
                .await
                .map_err(|_| ActuatorError::Timeout {
                    address: address.to_string(),
                })??
        } else {
            call.await?
        };

        if status.is_success() {
            Ok(())
        } else {
            debug!(%status, address, path, "controller rejected command");
            Err(ActuatorError::Rejected {
                address: address.to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn command(&self, address: &str, vm_id: &str, command: &str) -> ActuatorResult<()> {
        let path = format!("/virtual-machines/{vm_id}/{command}");
        self.post(address, &path, &serde_json::json!({}), true).await
    }
}

async fn send(
    address: &str,
    method: http::Method,
    path: &str,
    body: Bytes,
) -> ActuatorResult<http::StatusCode> {
    let uri = format!("http://{address}{path}");

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| ActuatorError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ActuatorError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "actuator connection closed with error");
        }
    });

    let req = http::Request::builder()
        .method(method)
        .uri(&uri)
        .header("host", address)
        .header("content-type", "application/json")
        .header("user-agent", "hivegrid/0.1")
        .body(Full::new(body))
        .map_err(|e| ActuatorError::Request {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ActuatorError::Request {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    Ok(resp.status())
}

#[async_trait]
impl VirtualMachineActuator for HttpActuator {
    async fn migrate_virtual_machine(
        &self,
        address: &str,
        request: &MigrationRequest,
    ) -> ActuatorResult<()> {
        // Bounded by the worker's migration timeout instead.
        let path = format!("/virtual-machines/{}/migrate", request.virtual_machine_id);
        self.post(address, &path, request, false).await
    }

    async fn start(&self, address: &str, vm: &VirtualMachineMetaData) -> ActuatorResult<()> {
        let path = format!("/virtual-machines/{}/start", vm.id);
        self.post(address, &path, vm, true).await
    }

    async fn suspend(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.command(address, vm_id, "suspend").await
    }

    async fn resume(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.command(address, vm_id, "resume").await
    }

    async fn shutdown(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.command(address, vm_id, "shutdown").await
    }

    async fn reboot(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.command(address, vm_id, "reboot").await
    }

    async fn destroy(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.command(address, vm_id, "destroy").await
    }

    async fn resize(
        &self,
        address: &str,
        vm_id: &str,
        capacity: &CapacityVector,
    ) -> ActuatorResult<()> {
        let path = format!("/virtual-machines/{vm_id}/resize");
        self.post(address, &path, &serde_json::json!({ "capacity": capacity }), true)
            .await
    }

    async fn is_active(&self, address: &str) -> bool {
        let check = send(address, http::Method::GET, "/health", Bytes::new());
        match tokio::time::timeout(self.request_timeout, check).await {
            Ok(Ok(status)) => status.is_success(),
            Ok(Err(e)) => {
                debug!(error = %e, address, "controller health check failed");
                false
            }
            Err(_) => {
                debug!(address, "controller health check timed out");
                false
            }
        }
    }
}

// ── Simulated ─────────────────────────────────────────────────────

/// A command accepted (or refused) by the [`SimulatedActuator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorCall {
    pub address: String,
    pub command: &'static str,
    pub virtual_machine_id: String,
}

/// Accepts every command unless the VM or controller was marked failing.
#[derive(Default)]
pub struct SimulatedActuator {
    calls: Mutex<Vec<ActuatorCall>>,
    failing_vms: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    delay: Duration,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every command for `vm_id` fail.
    pub fn fail_for(&self, vm_id: &str) {
        if let Ok(mut failing) = self.failing_vms.lock() {
            failing.insert(vm_id.to_string());
        }
    }

    /// Make the controller at `address` unreachable.
    pub fn disconnect(&self, address: &str) {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            unreachable.insert(address.to_string());
        }
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn record(&self, address: &str, command: &'static str, vm_id: &str) -> ActuatorResult<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ActuatorCall {
                address: address.to_string(),
                command,
                virtual_machine_id: vm_id.to_string(),
            });
        }
        let unreachable = self
            .unreachable
            .lock()
            .map(|u| u.contains(address))
            .unwrap_or(false);
        if unreachable {
            return Err(ActuatorError::Connect {
                address: address.to_string(),
                reason: "simulated disconnect".to_string(),
            });
        }
        let failing = self
            .failing_vms
            .lock()
            .map(|f| f.contains(vm_id))
            .unwrap_or(false);
        if failing {
            warn!(address, command, vm = %vm_id, "simulated command failure");
            return Err(ActuatorError::Rejected {
                address: address.to_string(),
                status: 500,
            });
        }
        debug!(address, command, vm = %vm_id, "simulated command accepted");
        Ok(())
    }
}

#[async_trait]
impl VirtualMachineActuator for SimulatedActuator {
    async fn migrate_virtual_machine(
        &self,
        address: &str,
        request: &MigrationRequest,
    ) -> ActuatorResult<()> {
        self.record(address, "migrate", &request.virtual_machine_id).await
    }

    async fn start(&self, address: &str, vm: &VirtualMachineMetaData) -> ActuatorResult<()> {
        self.record(address, "start", &vm.id).await
    }

    async fn suspend(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.record(address, "suspend", vm_id).await
    }

    async fn resume(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.record(address, "resume", vm_id).await
    }

    async fn shutdown(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.record(address, "shutdown", vm_id).await
    }

    async fn reboot(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.record(address, "reboot", vm_id).await
    }

    async fn destroy(&self, address: &str, vm_id: &str) -> ActuatorResult<()> {
        self.record(address, "destroy", vm_id).await
    }

    async fn resize(
        &self,
        address: &str,
        vm_id: &str,
        _capacity: &CapacityVector,
    ) -> ActuatorResult<()> {
        self.record(address, "resize", vm_id).await
    }

    async fn is_active(&self, address: &str) -> bool {
        self.unreachable
            .lock()
            .map(|u| !u.contains(address))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Accept one connection, capture the request head, answer with `status`.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (address, handle)
    }

    #[tokio::test]
    async fn http_command_hits_vm_path() {
        let (address, server) = one_shot_server("200 OK").await;
        let actuator = HttpActuator::new(Duration::from_secs(2));
        actuator.suspend(&address, "vm-1").await.unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("POST /virtual-machines/vm-1/suspend HTTP/1.1"));
    }

    #[tokio::test]
    async fn http_non_success_is_rejected() {
        let (address, _server) = one_shot_server("409 Conflict").await;
        let actuator = HttpActuator::new(Duration::from_secs(2));
        let err = actuator.reboot(&address, "vm-1").await.unwrap_err();
        assert!(matches!(err, ActuatorError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn http_connection_refused() {
        // Port 1 on loopback is not listening.
        let actuator = HttpActuator::new(Duration::from_secs(2));
        assert!(!actuator.is_active("127.0.0.1:1").await);
        assert!(matches!(
            actuator.destroy("127.0.0.1:1", "vm-1").await,
            Err(ActuatorError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn simulated_records_and_fails_on_demand() {
        let actuator = SimulatedActuator::new();
        actuator.fail_for("vm-bad");

        actuator.shutdown("lc-1:5000", "vm-ok").await.unwrap();
        assert!(actuator.shutdown("lc-1:5000", "vm-bad").await.is_err());

        let calls = actuator.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command, "shutdown");

        actuator.disconnect("lc-2:5000");
        assert!(!actuator.is_active("lc-2:5000").await);
        assert!(actuator.is_active("lc-1:5000").await);
    }
}
