// Host/controller command gate
//
// Commands to the controller are strictly request then reply: one command
// is outstanding at a time and the next waits for the previous reply. A
// reply that does not come within the timeout leaves host and controller
// out of step, so the gate refuses every later command until the host
// reinitializes it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Time the controller has to answer a command
pub const CMD_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Controller did not answer command 0x{0:04x}")]
    Timeout(u16),
    #[error("HCI out of sync; reinitialization required")]
    Desync,
    #[error("Command 0x{opcode:04x} failed with status 0x{status:02x}")]
    Status { opcode: u16, status: u8 },
    #[error("Transport: {0}")]
    Transport(String),
}

/// Byte transport to the controller
#[async_trait]
pub trait HciTransport: Send + Sync {
    async fn send_cmd(&self, opcode: u16, params: &[u8]) -> Result<(), HciError>;

    /// Wait for the Command Complete parameters of `opcode`, status octet
    /// first
    async fn recv_reply(&self, opcode: u16) -> Result<Vec<u8>, HciError>;
}

pub struct HciGate<T: HciTransport> {
    transport: T,
    lock: Mutex<()>,
    desync: AtomicBool,
    timeout: Duration,
}

impl<T: HciTransport> HciGate<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, CMD_TIMEOUT)
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            lock: Mutex::new(()),
            desync: AtomicBool::new(false),
            timeout,
        }
    }

    pub fn is_desync(&self) -> bool {
        self.desync.load(Ordering::Acquire)
    }

    /// Clear the desync state once the controller was reset
    pub fn reinit(&self) {
        info!("HCI gate reinitialized");
        self.desync.store(false, Ordering::Release);
    }

    /// Send a command and wait for its reply. Returns the return
    /// parameters after the status octet.
    pub async fn cmd(&self, opcode: u16, params: &[u8]) -> Result<Vec<u8>, HciError> {
        if self.is_desync() {
            return Err(HciError::Desync);
        }
        let _guard = self.lock.lock().await;
        // A command ahead of us may have timed out while we waited
        if self.is_desync() {
            return Err(HciError::Desync);
        }

        debug!("opcode 0x{:04x} len {}", opcode, params.len());
        self.transport.send_cmd(opcode, params).await?;

        let reply = match tokio::time::timeout(self.timeout, self.transport.recv_reply(opcode)).await {
            Ok(reply) => reply?,
            Err(_) => {
                error!("HCI command 0x{:04x} timed out; host out of sync", opcode);
                self.desync.store(true, Ordering::Release);
                return Err(HciError::Timeout(opcode));
            }
        };

        match reply.split_first() {
            Some((0, rest)) => Ok(rest.to_vec()),
            Some((&status, _)) => Err(HciError::Status { opcode, status }),
            None => Err(HciError::Transport(format!(
                "empty reply to 0x{:04x}",
                opcode
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Controller answering from a script; an exhausted script never answers
    #[derive(Default, Clone)]
    struct ScriptedController {
        sent: Arc<SyncMutex<Vec<u16>>>,
        replies: Arc<SyncMutex<VecDeque<Vec<u8>>>>,
    }

    impl ScriptedController {
        fn reply(&self, data: &[u8]) {
            self.replies.lock().push_back(data.to_vec());
        }
    }

    #[async_trait]
    impl HciTransport for ScriptedController {
        async fn send_cmd(&self, opcode: u16, _params: &[u8]) -> Result<(), HciError> {
            self.sent.lock().push(opcode);
            Ok(())
        }

        async fn recv_reply(&self, _opcode: u16) -> Result<Vec<u8>, HciError> {
            let next = self.replies.lock().pop_front();
            match next {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_reply_parameters() {
        let ctrl = ScriptedController::default();
        ctrl.reply(&[0x00, 0xaa, 0xbb]);
        ctrl.reply(&[0x0c]);
        let gate = HciGate::new(ctrl.clone());

        assert_eq!(gate.cmd(0x2006, &[1, 2]).await, Ok(vec![0xaa, 0xbb]));
        assert_eq!(
            gate.cmd(0x200a, &[1]).await,
            Err(HciError::Status {
                opcode: 0x200a,
                status: 0x0c
            })
        );
        assert_eq!(*ctrl.sent.lock(), vec![0x2006, 0x200a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_desyncs_until_reinit() {
        let ctrl = ScriptedController::default();
        let gate = HciGate::new(ctrl.clone());

        assert_eq!(gate.cmd(0x0c03, &[]).await, Err(HciError::Timeout(0x0c03)));
        assert!(gate.is_desync());

        ctrl.reply(&[0x00]);
        assert_eq!(gate.cmd(0x0c03, &[]).await, Err(HciError::Desync));
        assert_eq!(ctrl.sent.lock().len(), 1);

        gate.reinit();
        assert_eq!(gate.cmd(0x0c03, &[]).await, Ok(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_serialized() {
        let ctrl = ScriptedController::default();
        ctrl.reply(&[0x00, 1]);
        ctrl.reply(&[0x00, 2]);
        let gate = Arc::new(HciGate::new(ctrl.clone()));

        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.cmd(0x1001, &[]).await }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.cmd(0x1002, &[]).await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        let mut got = vec![a[0], b[0]];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert_eq!(ctrl.sent.lock().len(), 2);
    }
}
