// Async driver for a mesh stack
//
// The stack itself is synchronous and clock-free. This task owns the
// `Mesh`, feeds it host events from a command channel and advances its
// clock whenever the next deadline passes.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info};

use crate::access::ModelRef;
use crate::mesh::Mesh;
use crate::net::MsgCtx;
use crate::prov::{NodeRequest, ProvData};

type Reply<T> = mpsc::Sender<Result<T, String>>;

/// Commands that can be sent to the mesh task
#[derive(Debug)]
pub enum MeshCommand {
    /// Advertising report from the scanner
    AdvReceived { adv_type: u8, data: Vec<u8> },
    GattConnected { conn: u16 },
    GattDisconnected { conn: u16 },
    CccWrite { conn: u16, reply: Reply<()> },
    GattWrite {
        conn: u16,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    /// Extended advertising set finished
    AdvComplete,
    ProvEnable { reply: Reply<()> },
    Provision { data: ProvData, reply: Reply<()> },
    ProvisionAdv {
        request: NodeRequest,
        reply: Reply<u32>,
    },
    Publish { model: ModelRef, reply: Reply<()> },
    Send {
        model: ModelRef,
        ctx: MsgCtx,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    IsProvisioned { reply: mpsc::Sender<bool> },
    /// Write pending settings to the store now
    Flush { reply: Reply<()> },
    /// Flush settings and stop the task
    Shutdown,
}

/// Handle to communicate with the running mesh task
#[derive(Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    async fn command(&self, cmd: MeshCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("Mesh task not running"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> MeshCommand,
    ) -> Result<T> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command(build(reply_tx)).await?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from mesh task"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn adv_received(&self, adv_type: u8, data: Vec<u8>) -> Result<()> {
        self.command(MeshCommand::AdvReceived { adv_type, data }).await
    }

    pub async fn gatt_connected(&self, conn: u16) -> Result<()> {
        self.command(MeshCommand::GattConnected { conn }).await
    }

    pub async fn gatt_disconnected(&self, conn: u16) -> Result<()> {
        self.command(MeshCommand::GattDisconnected { conn }).await
    }

    pub async fn ccc_write(&self, conn: u16) -> Result<()> {
        self.request(|reply| MeshCommand::CccWrite { conn, reply })
            .await
    }

    pub async fn gatt_write(&self, conn: u16, data: Vec<u8>) -> Result<()> {
        self.request(|reply| MeshCommand::GattWrite { conn, data, reply })
            .await
    }

    pub async fn adv_complete(&self) -> Result<()> {
        self.command(MeshCommand::AdvComplete).await
    }

    pub async fn prov_enable(&self) -> Result<()> {
        self.request(|reply| MeshCommand::ProvEnable { reply }).await
    }

    pub async fn provision(&self, data: ProvData) -> Result<()> {
        self.request(|reply| MeshCommand::Provision { data, reply })
            .await
    }

    /// Provision a device over PB-ADV; returns the link ID
    pub async fn provision_adv(&self, request: NodeRequest) -> Result<u32> {
        self.request(|reply| MeshCommand::ProvisionAdv { request, reply })
            .await
    }

    pub async fn publish(&self, model: ModelRef) -> Result<()> {
        self.request(|reply| MeshCommand::Publish { model, reply })
            .await
    }

    pub async fn send(&self, model: ModelRef, ctx: MsgCtx, payload: Vec<u8>) -> Result<()> {
        self.request(|reply| MeshCommand::Send {
            model,
            ctx,
            payload,
            reply,
        })
        .await
    }

    pub async fn is_provisioned(&self) -> Result<bool> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command(MeshCommand::IsProvisioned { reply: reply_tx })
            .await?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from mesh task"))
    }

    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| MeshCommand::Flush { reply }).await
    }

    /// Shut down the mesh task
    pub async fn shutdown(&self) -> Result<()> {
        self.command(MeshCommand::Shutdown).await
    }
}

/// Start the mesh event loop, returning a handle for communication.
///
/// The stack clock starts at zero when the task starts; the join handle
/// yields the mesh back after shutdown.
pub fn start_mesh(mesh: Mesh) -> (MeshHandle, tokio::task::JoinHandle<Mesh>) {
    let (command_tx, mut command_rx) = mpsc::channel::<MeshCommand>(256);
    let handle = MeshHandle { command_tx };

    let task = tokio::spawn(async move {
        let mut mesh = mesh;
        let epoch = Instant::now();
        let base = mesh.now();
        info!("Mesh task started");

        loop {
            // Without pending work, wake up only for commands
            let wake = mesh
                .next_deadline()
                .map(|deadline| epoch + Duration::from_millis(deadline.saturating_sub(base)))
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = sleep_until(wake) => {
                    let now = base + epoch.elapsed().as_millis() as u64;
                    mesh.advance_to(now);
                }
                cmd = command_rx.recv() => {
                    // Catch the clock up first so the command sees current time
                    let now = base + epoch.elapsed().as_millis() as u64;
                    mesh.advance_to(now);

                    let Some(cmd) = cmd else {
                        debug!("All mesh handles dropped");
                        break;
                    };
                    if !handle_command(&mut mesh, cmd) {
                        break;
                    }
                }
            }
        }

        if let Err(e) = mesh.settings_flush() {
            error!("Final settings flush failed: {}", e);
        }
        info!("Mesh task stopped");
        mesh
    });

    (handle, task)
}

fn reply<T>(reply: Reply<T>, result: crate::error::Result<T>) {
    let _ = reply.try_send(result.map_err(|e| e.to_string()));
}

/// Returns false when the task should stop
fn handle_command(mesh: &mut Mesh, cmd: MeshCommand) -> bool {
    match cmd {
        MeshCommand::AdvReceived { adv_type, data } => mesh.scan_recv(adv_type, &data),
        MeshCommand::GattConnected { conn } => mesh.gatt_connected(conn),
        MeshCommand::GattDisconnected { conn } => mesh.gatt_disconnected(conn),
        MeshCommand::CccWrite { conn, reply: tx } => reply(tx, mesh.gatt_ccc_write(conn)),
        MeshCommand::GattWrite {
            conn,
            data,
            reply: tx,
        } => reply(tx, mesh.gatt_write(conn, &data)),
        MeshCommand::AdvComplete => mesh.adv_complete(),
        MeshCommand::ProvEnable { reply: tx } => reply(tx, mesh.prov_enable()),
        MeshCommand::Provision { data, reply: tx } => reply(tx, mesh.provision(&data)),
        MeshCommand::ProvisionAdv { request, reply: tx } => reply(tx, mesh.provision_adv(request)),
        MeshCommand::Publish { model, reply: tx } => reply(tx, mesh.model_publish(model)),
        MeshCommand::Send {
            model,
            ctx,
            payload,
            reply: tx,
        } => reply(tx, mesh.model_send(model, ctx, payload)),
        MeshCommand::IsProvisioned { reply: tx } => {
            let _ = tx.try_send(mesh.is_provisioned());
        }
        MeshCommand::Flush { reply: tx } => reply(tx, mesh.settings_flush()),
        MeshCommand::Shutdown => {
            info!("Mesh shutting down");
            return false;
        }
    }
    true
}
