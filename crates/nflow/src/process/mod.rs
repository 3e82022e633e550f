//! Process Registry
//!
//! Live-run table keyed by run id. A process exists exactly while its run is
//! executing; kill sets the exit flag the step loop reads at each iteration
//! head, closes any attached websocket, and nudges the callback channel so a
//! plugin-owned subprocess unblocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::types::RunState;

/// Bound of the per-process callback mailbox
pub const CALLBACK_BUFFER: usize = 16;

/// Message sent on kill and on run teardown
pub const EXIT_MESSAGE: &str = r#"{"error_exit":"exit"}"#;

/// One live workflow run
pub struct Process {
    pub uuid: Uuid,
    pub kind: String,
    pub killable: bool,
    current_node: Mutex<String>,
    state: Mutex<RunState>,
    callback_tx: mpsc::Sender<String>,
    exit_flag: AtomicBool,
    ws_close: Mutex<Option<oneshot::Sender<()>>>,
}

/// Copy of a process row for external readers
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub uuid: Uuid,
    pub kind: String,
    pub killable: bool,
    pub current_node: String,
    pub state: RunState,
}

impl Process {
    /// Create a process and the receiving end of its callback mailbox
    pub fn new(kind: &str, killable: bool) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::with_uuid(Uuid::new_v4(), kind, killable)
    }

    /// Create a process under a caller-chosen run id (fan-out branches pick
    /// theirs before spawning so the parent can surface it)
    pub fn with_uuid(
        uuid: Uuid,
        kind: &str,
        killable: bool,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (callback_tx, callback_rx) = mpsc::channel(CALLBACK_BUFFER);
        (
            Arc::new(Self {
                uuid,
                kind: kind.to_string(),
                killable,
                current_node: Mutex::new(String::new()),
                state: Mutex::new(RunState::Wait),
                callback_tx,
                exit_flag: AtomicBool::new(false),
                ws_close: Mutex::new(None),
            }),
            callback_rx,
        )
    }

    pub fn set_current_node(&self, node: &str) {
        *self.current_node.lock() = node.to_string();
    }

    pub fn current_node(&self) -> String {
        self.current_node.lock().clone()
    }

    pub fn set_state(&self, state: RunState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Sender side of the callback mailbox (handed to callback plugins)
    pub fn callback(&self) -> mpsc::Sender<String> {
        self.callback_tx.clone()
    }

    /// Checked at the head of every step iteration
    pub fn exit_requested(&self) -> bool {
        self.exit_flag.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.exit_flag.store(true, Ordering::SeqCst);
    }

    /// Attach a websocket close handle; kill fires it
    pub fn attach_ws(&self, close: oneshot::Sender<()>) {
        *self.ws_close.lock() = Some(close);
    }

    fn close_ws(&self) {
        if let Some(close) = self.ws_close.lock().take() {
            let _ = close.send(());
        }
    }

    /// Non-blocking exit nudge on the callback mailbox; dropped when the
    /// receiver is gone or the mailbox is full.
    pub fn notify_exit(&self) {
        let _ = self.callback_tx.try_send(EXIT_MESSAGE.to_string());
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            uuid: self.uuid,
            kind: self.kind.clone(),
            killable: self.killable,
            current_node: self.current_node(),
            state: self.state(),
        }
    }
}

/// Table of live processes
#[derive(Default)]
pub struct ProcessRegistry {
    processes: DashMap<Uuid, Arc<Process>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, process: Arc<Process>) {
        self.processes.insert(process.uuid, process);
    }

    pub fn remove(&self, uuid: &Uuid) {
        self.processes.remove(uuid);
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<Process>> {
        self.processes.get(uuid).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Copies of every live row
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes.iter().map(|p| p.info()).collect()
    }

    /// Kill one run: set the exit flag, close the websocket, nudge the
    /// callback mailbox. Returns whether the run existed.
    pub fn kill(&self, uuid: &Uuid) -> bool {
        let Some(process) = self.get(uuid) else {
            return false;
        };
        process.request_exit();
        process.close_ws();
        process.notify_exit();
        tracing::info!(wid = %uuid, "process killed");
        true
    }

    /// Kill every live run over a snapshot of the current keys
    pub fn kill_all(&self) -> usize {
        let uuids: Vec<Uuid> = self.processes.iter().map(|p| p.uuid).collect();
        let mut killed = 0;
        for uuid in uuids {
            if self.kill(&uuid) {
                killed += 1;
            }
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = ProcessRegistry::new();
        let (process, _rx) = Process::new("http", true);
        let uuid = process.uuid;

        registry.register(process);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&uuid).is_some());

        registry.remove(&uuid);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_kill_sets_flag_and_notifies() {
        let registry = ProcessRegistry::new();
        let (process, mut rx) = Process::new("callback", true);
        let uuid = process.uuid;
        registry.register(process.clone());

        assert!(!process.exit_requested());
        assert!(registry.kill(&uuid));
        assert!(process.exit_requested());
        assert_eq!(rx.recv().await.as_deref(), Some(EXIT_MESSAGE));
    }

    #[tokio::test]
    async fn test_kill_closes_ws() {
        let registry = ProcessRegistry::new();
        let (process, _rx) = Process::new("http", true);
        let uuid = process.uuid;
        let (close_tx, close_rx) = oneshot::channel();
        process.attach_ws(close_tx);
        registry.register(process);

        registry.kill(&uuid);
        assert!(close_rx.await.is_ok());
    }

    #[test]
    fn test_notify_exit_without_receiver_is_dropped() {
        let (process, rx) = Process::new("http", true);
        drop(rx);
        // Must not block or panic.
        process.notify_exit();
    }

    #[test]
    fn test_kill_all_snapshot() {
        let registry = ProcessRegistry::new();
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (process, rx) = Process::new("http", true);
            rxs.push(rx);
            registry.register(process);
        }
        assert_eq!(registry.kill_all(), 3);
        for info in registry.list() {
            let process = registry.get(&info.uuid).unwrap();
            assert!(process.exit_requested());
        }
    }
}
