//! Background upload worker.
//!
//! A single drain task per process: it connects, authenticates, provisions
//! remote directories, and stores queued files one by one, removing each
//! record only after the server confirms the store. Any session failure
//! faults the run and leaves the failing record at the queue head; the next
//! trigger (a new enqueue, a config reload, or process restart with a
//! non-empty queue) starts a fresh run from the current head. There is no
//! internal retry loop.

use std::fs::File;
use std::io::ErrorKind;
use std::sync::Arc;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, UplinkError};
use crate::queue::DurableQueue;
use crate::session::{RemoteSession, SessionFactory};

/// Read-only snapshot of the remote endpoint configuration, taken once at
/// the start of every run so a reload never changes credentials mid-drain.
#[derive(Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory all relative paths are provisioned under.
    pub root_dir: String,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

/// Source of the current [`RemoteTarget`] snapshot.
pub trait TargetProvider: Send + Sync {
    fn target(&self) -> RemoteTarget;
}

/// Observable drain state, advanced in order and readable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Connecting = 1,
    Authenticating = 2,
    Draining = 3,
    Faulted = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Draining,
            4 => Self::Faulted,
            _ => Self::Idle,
        }
    }
}

/// The single background drain task and its lifecycle flag.
///
/// At most one run may be active at a time; [`UploadWorker::start`] enforces
/// that with a compare-and-swap on the lifecycle flag, so concurrent starts
/// collapse into one run instead of racing a liveness check.
pub struct UploadWorker {
    queue: Arc<DurableQueue>,
    targets: Arc<dyn TargetProvider>,
    sessions: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
    running: AtomicBool,
    state: AtomicU8,
}

impl fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadWorker")
            .field("pending", &self.queue.len())
            .field("running", &self.is_running())
            .field("state", &self.state())
            .finish()
    }
}

impl UploadWorker {
    pub fn new(
        queue: Arc<DurableQueue>,
        targets: Arc<dyn TargetProvider>,
        sessions: Arc<dyn SessionFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            targets,
            sessions,
            cancel,
            running: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    /// Ensure a drain task is running. Returns false, as a no-op, when one
    /// is already active.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let worker = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            worker.run();
            worker.running.store(false, Ordering::Release);
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// One full drain attempt against a fresh session. Blocking.
    fn run(&self) {
        let mut session = self.sessions.create();
        let outcome = self.drain(session.as_mut());
        if let Err(err) = session.disconnect() {
            debug!(error = %err, "disconnect after drain failed");
        }

        match outcome {
            Ok(()) => {}
            Err(UplinkError::Cancelled) => {
                info!(pending = self.queue.len(), "upload run cancelled")
            }
            Err(err) => {
                self.set_state(WorkerState::Faulted);
                error!(
                    error = %err,
                    pending = self.queue.len(),
                    "upload run faulted, will retry from queue head on next trigger"
                );
            }
        }
    }

    fn drain(&self, session: &mut dyn RemoteSession) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.set_state(WorkerState::Idle);
            return Err(UplinkError::Cancelled);
        }

        let target = self.targets.target();

        self.set_state(WorkerState::Connecting);
        session.connect(&target.host, target.port)?;

        self.set_state(WorkerState::Authenticating);
        session.login(&target.username, &target.password)?;
        session.set_binary()?;

        self.set_state(WorkerState::Draining);
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(WorkerState::Idle);
                return Err(UplinkError::Cancelled);
            }

            let record = match self.queue.peek() {
                Ok(record) => record,
                Err(UplinkError::QueueEmpty) => {
                    self.set_state(WorkerState::Idle);
                    info!("upload queue drained");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let mut reader = match File::open(&record.local_path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    // Vacuous success: the source disappeared before it
                    // could be sent, so there is nothing left to retry.
                    info!(
                        local = %record.local_path.display(),
                        "local file vanished before upload, dropping record"
                    );
                    self.queue.remove(record.id());
                    continue;
                }
                Err(err) => {
                    return Err(UplinkError::Store {
                        path: record.remote_path.clone(),
                        reason: err.to_string(),
                    });
                }
            };

            let file_name = provision(session, &target.root_dir, &record.remote_path)?;

            debug!(
                local = %record.local_path.display(),
                remote = %record.remote_path,
                "storing file"
            );
            session
                .store(&file_name, &mut reader)
                .map_err(|err| UplinkError::Store {
                    path: record.remote_path.clone(),
                    reason: err.to_string(),
                })?;

            // Return to the configured root so the next transfer starts
            // from a known location.
            session
                .change_dir(&target.root_dir)
                .map_err(|err| UplinkError::Provision {
                    path: target.root_dir.clone(),
                    reason: err.to_string(),
                })?;

            self.queue.remove(record.id());
            info!(remote = %record.remote_path, "upload confirmed");
        }
    }

    fn set_state(&self, next: WorkerState) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            debug!(from = ?WorkerState::from_u8(prev), to = ?next, "worker state");
        }
    }
}

/// Ensure the remote directory chain for `remote_path` exists and leave the
/// session inside it.
///
/// Every `/`-separated segment but the last names a directory: try to change
/// into it, create it when that fails, then change into it. Returns the
/// final segment, the name to store from the target directory.
fn provision(
    session: &mut dyn RemoteSession,
    root_dir: &str,
    remote_path: &str,
) -> Result<String> {
    session
        .change_dir(root_dir)
        .map_err(|err| UplinkError::Provision {
            path: root_dir.to_string(),
            reason: err.to_string(),
        })?;

    let mut segments: Vec<&str> = remote_path.split('/').filter(|s| !s.is_empty()).collect();
    let file_name = segments.pop().ok_or_else(|| UplinkError::Provision {
        path: remote_path.to_string(),
        reason: "remote path has no file name".to_string(),
    })?;

    let mut current = root_dir.trim_end_matches('/').to_string();
    for segment in segments {
        current.push('/');
        current.push_str(segment);

        if session.change_dir(segment).is_err() {
            session
                .make_dir(segment)
                .map_err(|err| UplinkError::Provision {
                    path: current.clone(),
                    reason: err.to_string(),
                })?;
            session
                .change_dir(segment)
                .map_err(|err| UplinkError::Provision {
                    path: current.clone(),
                    reason: err.to_string(),
                })?;
        }
        debug!(dir = %current, "entered remote directory");
    }

    Ok(file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TransferRecord;

    use std::collections::HashSet;
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};

    /// Shared script driving every session a test factory hands out; records
    /// the full call sequence for order assertions.
    #[derive(Default)]
    struct SessionScript {
        calls: Mutex<Vec<String>>,
        dirs: Mutex<HashSet<String>>,
        fail_connect: bool,
        fail_login: bool,
        fail_mkdir: bool,
        fail_store: bool,
        sessions_created: AtomicU8,
        connect_gate: Mutex<Option<Receiver<()>>>,
    }

    impl SessionScript {
        fn with_root(root: &str) -> Self {
            let script = Self::default();
            script.dirs.lock().unwrap().insert(root.to_string());
            script
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct ScriptedSession(Arc<SessionScript>);

    impl RemoteSession for ScriptedSession {
        fn connect(&mut self, host: &str, port: u16) -> Result<()> {
            self.0.record(format!("connect {host}:{port}"));
            if let Some(gate) = self.0.connect_gate.lock().unwrap().take() {
                gate.recv().ok();
            }
            if self.0.fail_connect {
                return Err(UplinkError::Connect {
                    host: host.to_string(),
                    port,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        fn login(&mut self, username: &str, _password: &str) -> Result<()> {
            self.0.record(format!("login {username}"));
            if self.0.fail_login {
                return Err(UplinkError::Auth {
                    username: username.to_string(),
                    reason: "bad credentials".to_string(),
                });
            }
            Ok(())
        }

        fn set_binary(&mut self) -> Result<()> {
            self.0.record("binary".to_string());
            Ok(())
        }

        fn change_dir(&mut self, path: &str) -> Result<()> {
            self.0.record(format!("cwd {path}"));
            if self.0.dirs.lock().unwrap().contains(path) {
                Ok(())
            } else {
                Err(UplinkError::Session(format!("no such directory: {path}")))
            }
        }

        fn make_dir(&mut self, path: &str) -> Result<()> {
            self.0.record(format!("mkd {path}"));
            if self.0.fail_mkdir {
                return Err(UplinkError::Session("permission denied".to_string()));
            }
            self.0.dirs.lock().unwrap().insert(path.to_string());
            Ok(())
        }

        fn store(&mut self, remote_name: &str, reader: &mut dyn Read) -> Result<()> {
            let mut content = Vec::new();
            reader.read_to_end(&mut content).unwrap();
            self.0.record(format!("store {remote_name}"));
            if self.0.fail_store {
                return Err(UplinkError::Session("transfer aborted".to_string()));
            }
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.0.record("disconnect".to_string());
            Ok(())
        }
    }

    struct ScriptedSessions(Arc<SessionScript>);

    impl SessionFactory for ScriptedSessions {
        fn create(&self) -> Box<dyn RemoteSession> {
            self.0.sessions_created.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedSession(Arc::clone(&self.0)))
        }
    }

    const ROOT: &str = "/srv/incoming";

    struct FixedTarget;

    impl TargetProvider for FixedTarget {
        fn target(&self) -> RemoteTarget {
            RemoteTarget {
                host: "ftp.example.test".to_string(),
                port: 21,
                username: "submit".to_string(),
                password: "secret".to_string(),
                root_dir: ROOT.to_string(),
            }
        }
    }

    fn worker_with(
        script: &Arc<SessionScript>,
        queue: Arc<DurableQueue>,
        cancel: CancellationToken,
    ) -> Arc<UploadWorker> {
        Arc::new(UploadWorker::new(
            queue,
            Arc::new(FixedTarget),
            Arc::new(ScriptedSessions(Arc::clone(script))),
            cancel,
        ))
    }

    fn local_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"payload").unwrap();
        path
    }

    fn queue_in(dir: &Path) -> Arc<DurableQueue> {
        Arc::new(DurableQueue::open(dir.join("queue.json")))
    }

    #[test]
    fn provisions_missing_directories_then_returns_to_root() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "c.txt"),
            "a/b/c.txt".to_string(),
        ));

        let script = Arc::new(SessionScript::with_root(ROOT));
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        worker.run();

        assert_eq!(
            script.calls(),
            vec![
                "connect ftp.example.test:21",
                "login submit",
                "binary",
                "cwd /srv/incoming",
                "cwd a",
                "mkd a",
                "cwd a",
                "cwd b",
                "mkd b",
                "cwd b",
                "store c.txt",
                "cwd /srv/incoming",
                "disconnect",
            ]
        );
        assert!(queue.is_empty());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn drains_in_enqueue_order() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "one.txt"),
            "one.txt".to_string(),
        ));
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "two.txt"),
            "two.txt".to_string(),
        ));

        let script = Arc::new(SessionScript::with_root(ROOT));
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        worker.run();

        let stores: Vec<String> = script
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("store "))
            .collect();
        assert_eq!(stores, vec!["store one.txt", "store two.txt"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn vanished_local_file_is_vacuous_success() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            dir.path().join("never-existed.txt"),
            "never-existed.txt".to_string(),
        ));

        let script = Arc::new(SessionScript::with_root(ROOT));
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        worker.run();

        let calls = script.calls();
        assert!(!calls.iter().any(|call| call.starts_with("store")));
        assert!(!calls.iter().any(|call| call.starts_with("cwd")));
        assert!(queue.is_empty());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn connect_failure_faults_without_consuming_the_queue() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "a.txt"),
            "a.txt".to_string(),
        ));

        let script = Arc::new(SessionScript {
            fail_connect: true,
            ..SessionScript::with_root(ROOT)
        });
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        worker.run();

        assert_eq!(worker.state(), WorkerState::Faulted);
        assert_eq!(queue.len(), 1);
        assert!(!script.calls().iter().any(|call| call.starts_with("login")));
    }

    #[test]
    fn auth_failure_faults_and_disconnects() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "a.txt"),
            "a.txt".to_string(),
        ));

        let script = Arc::new(SessionScript {
            fail_login: true,
            ..SessionScript::with_root(ROOT)
        });
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        worker.run();

        assert_eq!(worker.state(), WorkerState::Faulted);
        assert_eq!(queue.len(), 1);
        assert_eq!(script.calls().last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn provision_failure_keeps_record_at_head() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        let record = TransferRecord::new(local_file(&dir, "c.txt"), "a/c.txt".to_string());
        let id = record.id();
        queue.enqueue(record);

        let script = Arc::new(SessionScript {
            fail_mkdir: true,
            ..SessionScript::with_root(ROOT)
        });
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());

        let mut session = ScriptedSession(Arc::clone(&script));
        let err = worker.drain(&mut session).unwrap_err();

        assert!(matches!(err, UplinkError::Provision { .. }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().id(), id);
        assert!(!script.calls().iter().any(|call| call.starts_with("store")));
    }

    #[test]
    fn store_failure_keeps_record_at_head() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        let record = TransferRecord::new(local_file(&dir, "a.txt"), "a.txt".to_string());
        let id = record.id();
        queue.enqueue(record);

        let script = Arc::new(SessionScript {
            fail_store: true,
            ..SessionScript::with_root(ROOT)
        });
        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());

        let mut session = ScriptedSession(Arc::clone(&script));
        let err = worker.drain(&mut session).unwrap_err();

        assert!(matches!(err, UplinkError::Store { .. }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().id(), id);
    }

    #[test]
    fn cancellation_before_connect_touches_nothing() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        queue.enqueue(TransferRecord::new(
            local_file(&dir, "a.txt"),
            "a.txt".to_string(),
        ));

        let script = Arc::new(SessionScript::with_root(ROOT));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = worker_with(&script, Arc::clone(&queue), cancel);

        let mut session = ScriptedSession(Arc::clone(&script));
        let err = worker.drain(&mut session).unwrap_err();

        assert!(matches!(err, UplinkError::Cancelled));
        assert!(script.calls().is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_collapse_into_one_run() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());

        let (release, gate) = std::sync::mpsc::channel();
        let script = Arc::new(SessionScript::with_root(ROOT));
        *script.connect_gate.lock().unwrap() = Some(gate);

        let worker = worker_with(&script, Arc::clone(&queue), CancellationToken::new());
        assert!(worker.start());

        // Wait for the run to reach the gated connect, then hammer start().
        wait_until(|| !script.calls().is_empty()).await;
        for _ in 0..8 {
            assert!(!worker.start());
        }
        assert_eq!(script.sessions_created.load(Ordering::SeqCst), 1);

        release.send(()).unwrap();
        wait_until(|| !worker.is_running()).await;

        // Once the run finished, a new trigger is accepted again.
        assert!(worker.start());
        wait_until(|| !worker.is_running()).await;
        assert_eq!(script.sessions_created.load(Ordering::SeqCst), 2);
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }
}
