//! End-to-end behaviour of spawned children against real programs.

use procplex::{
    PoolConfig, ProcessBuilder, ProcessHandle, ProcessListener, ProcessPool, SpawnError, StdinBuffer,
    EXIT_ABNORMAL, EXIT_LAUNCH_FAILURE,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(20);

/// Writes `total` bytes of a repeating pattern to the child, then closes stdin.
struct EchoListener {
    payload: Vec<u8>,
    written: usize,
    received: Arc<Mutex<crc32fast::Hasher>>,
    received_len: Arc<AtomicUsize>,
    started: bool,
}

impl EchoListener {
    fn new(total: usize) -> Self {
        Self::seeded(total, 0)
    }

    /// A payload unique to `seed`, so echoes of different children differ.
    fn seeded(total: usize, seed: usize) -> Self {
        let payload = (0..total).map(|i| ((i * (seed + 1) + seed) % 251) as u8).collect();
        Self {
            payload,
            written: 0,
            received: Arc::new(Mutex::new(crc32fast::Hasher::new())),
            received_len: Arc::new(AtomicUsize::new(0)),
            started: false,
        }
    }

    fn expected_checksum(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }
}

impl ProcessListener for EchoListener {
    fn on_start(&mut self, process: &ProcessHandle) {
        self.started = true;
        process.want_write();
    }

    fn on_stdout(&mut self, buffer: &[u8]) {
        self.received.lock().unwrap().update(buffer);
        self.received_len.fetch_add(buffer.len(), Ordering::SeqCst);
    }

    fn on_stdin_ready(&mut self, buffer: &mut StdinBuffer) -> bool {
        assert!(self.started);
        self.written += buffer.put(&self.payload[self.written..]);
        self.written < self.payload.len()
    }
}

#[test]
fn test_large_echo_through_cat() {
    const TOTAL: usize = 600_000;
    let listener = EchoListener::new(TOTAL);
    let expected = listener.expected_checksum();
    let received = Arc::clone(&listener.received);
    let received_len = Arc::clone(&listener.received_len);

    let handle = ProcessBuilder::new(["/bin/cat"]).try_start(listener).unwrap();
    assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));

    assert_eq!(received_len.load(Ordering::SeqCst), TOTAL);
    let checksum = std::mem::replace(&mut *received.lock().unwrap(), crc32fast::Hasher::new()).finalize();
    assert_eq!(checksum, expected);
}

#[test]
fn test_many_concurrent_cats() {
    const PROCESSES: usize = 50;
    const TOTAL: usize = 20_000;
    let pool = ProcessPool::new(PoolConfig::default().with_threads(2)).unwrap();

    let mut runs = Vec::new();
    for seed in 0..PROCESSES {
        let listener = EchoListener::seeded(TOTAL, seed);
        let expected = listener.expected_checksum();
        let received = Arc::clone(&listener.received);
        let received_len = Arc::clone(&listener.received_len);
        let handle = ProcessBuilder::new(["/bin/cat"])
            .pool(pool.clone())
            .try_start(listener)
            .unwrap();
        runs.push((handle, expected, received, received_len));
    }

    let mut checksums = std::collections::HashSet::new();
    for (handle, expected, received, received_len) in runs {
        assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));
        assert_eq!(received_len.load(Ordering::SeqCst), TOTAL);
        let checksum = received.lock().unwrap().clone().finalize();
        assert_eq!(checksum, expected, "pid {} echoed another child's bytes", handle.pid());
        checksums.insert(checksum);
    }
    assert_eq!(checksums.len(), PROCESSES);

    let stats = pool.stats();
    assert_eq!(stats.total.registered, PROCESSES as u64);
    assert_eq!(stats.total.stdout_bytes, (PROCESSES * TOTAL) as u64);
    assert!(stats.processors.iter().all(|p| p.registered == (PROCESSES / 2) as u64));
}

#[test]
fn test_concurrent_spawners() {
    let pool = ProcessPool::new(PoolConfig::default().with_threads(1)).unwrap();
    let spawners: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                (0..5)
                    .map(|_| {
                        ProcessBuilder::new(["/bin/echo", "x"])
                            .pool(pool.clone())
                            .try_start(procplex::NullListener)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for spawner in spawners {
        for handle in spawner.join().unwrap() {
            assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));
        }
    }
}

/// Records every callback in arrival order.
#[derive(Clone, Default)]
struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
    exited: Arc<AtomicBool>,
    late: Arc<AtomicBool>,
}

impl Journal {
    fn push(&self, entry: String) {
        if self.exited.load(Ordering::SeqCst) {
            self.late.store(true, Ordering::SeqCst);
        }
        self.entries.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

impl ProcessListener for Journal {
    fn on_start(&mut self, _process: &ProcessHandle) {
        self.push("start".into());
    }

    fn on_stdout(&mut self, buffer: &[u8]) {
        self.push(format!("stdout:{}", String::from_utf8_lossy(buffer)));
    }

    fn on_stderr(&mut self, buffer: &[u8]) {
        self.push(format!("stderr:{}", String::from_utf8_lossy(buffer)));
    }

    fn on_exit(&mut self, exit_code: i32) {
        self.push(format!("exit:{exit_code}"));
        self.exited.store(true, Ordering::SeqCst);
    }
}

fn run_journaled(command: &[&str]) -> (i32, Journal) {
    let journal = Journal::default();
    let (tx, rx) = mpsc::channel();
    struct Done(Journal, mpsc::Sender<()>);
    impl ProcessListener for Done {
        fn on_start(&mut self, p: &ProcessHandle) {
            self.0.on_start(p)
        }
        fn on_stdout(&mut self, b: &[u8]) {
            self.0.on_stdout(b)
        }
        fn on_stderr(&mut self, b: &[u8]) {
            self.0.on_stderr(b)
        }
        fn on_exit(&mut self, code: i32) {
            self.0.on_exit(code);
            let _ = self.1.send(());
        }
    }

    let handle = ProcessBuilder::new(command)
        .try_start(Done(journal.clone(), tx))
        .unwrap();
    let code = handle.wait_for_timeout(TIMEOUT).expect("child did not exit");
    rx.recv_timeout(TIMEOUT).expect("on_exit was not delivered");
    (code, journal)
}

#[test]
fn test_callback_order_and_exit_code() {
    let (code, journal) = run_journaled(&["/bin/sh", "-c", "printf out; printf err >&2; exit 3"]);
    assert_eq!(code, 3);

    let entries = journal.entries();
    assert_eq!(entries.first().map(String::as_str), Some("start"));
    assert_eq!(entries.last().map(String::as_str), Some("exit:3"));
    assert!(entries.contains(&"stdout:out".to_string()));
    assert!(entries.contains(&"stderr:err".to_string()));
    assert!(entries.contains(&"stdout:".to_string()));
    assert!(entries.contains(&"stderr:".to_string()));
    assert_eq!(entries.iter().filter(|e| e.starts_with("exit:")).count(), 1);
}

#[test]
fn test_no_callbacks_after_exit() {
    let (_, journal) = run_journaled(&["/bin/sh", "-c", "echo a; echo b >&2"]);
    thread::sleep(Duration::from_millis(100));
    assert!(!journal.late.load(Ordering::SeqCst));
}

#[test]
fn test_killed_by_signal_is_abnormal() {
    let (code, journal) = run_journaled(&["/bin/sh", "-c", "kill -KILL $$"]);
    assert_eq!(code, EXIT_ABNORMAL);
    assert_eq!(journal.entries().last().map(String::as_str), Some("exit:-1"));
}

#[test]
fn test_missing_program_reports_launch_failure() {
    let (tx, rx) = mpsc::channel();
    struct ExitOnly(mpsc::Sender<i32>);
    impl ProcessListener for ExitOnly {
        fn on_start(&mut self, _process: &ProcessHandle) {
            panic!("on_start must not run for a failed launch");
        }
        fn on_exit(&mut self, exit_code: i32) {
            self.0.send(exit_code).unwrap();
        }
    }

    let handle = ProcessBuilder::new(["/bin/zxczxc"]).start(ExitOnly(tx));
    assert!(handle.is_none());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), EXIT_LAUNCH_FAILURE);
}

#[test]
fn test_missing_program_error() {
    let err = ProcessBuilder::new(["/bin/zxczxc"])
        .try_start(procplex::NullListener)
        .unwrap_err();
    assert!(matches!(err, SpawnError::NotFound { .. }), "got {err:?}");
}

#[test]
fn test_permission_denied() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.sh");
    let mut file = std::fs::File::create(&script).unwrap();
    writeln!(file, "#!/bin/sh\necho never").unwrap();
    drop(file);
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

    let err = ProcessBuilder::new([script.as_os_str()])
        .try_start(procplex::NullListener)
        .unwrap_err();
    assert!(matches!(err, SpawnError::PermissionDenied { .. }), "got {err:?}");
}

#[test]
fn test_stdin_close_is_idempotent() {
    let handle = ProcessBuilder::new(["/bin/cat"])
        .try_start(procplex::NullListener)
        .unwrap();
    handle.stdin_close();
    handle.stdin_close();
    assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));
    handle.stdin_close();
}

#[test]
fn test_destroy_releases_waiters() {
    let handle = ProcessBuilder::new(["/bin/sleep", "30"])
        .try_start(procplex::NullListener)
        .unwrap();
    assert!(handle.is_running());

    let waiter = {
        let handle = handle.clone();
        thread::spawn(move || handle.wait_for())
    };
    thread::sleep(Duration::from_millis(50));
    handle.destroy();

    assert_eq!(waiter.join().unwrap(), EXIT_ABNORMAL);
    assert!(!handle.is_running());
    assert_eq!(handle.try_exit_code(), Some(EXIT_ABNORMAL));
}

#[test]
fn test_environment_and_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel();
    struct Collect(Vec<u8>, mpsc::Sender<Vec<u8>>);
    impl ProcessListener for Collect {
        fn on_stdout(&mut self, buffer: &[u8]) {
            self.0.extend_from_slice(buffer);
        }
        fn on_exit(&mut self, _exit_code: i32) {
            let _ = self.1.send(std::mem::take(&mut self.0));
        }
    }

    let handle = ProcessBuilder::new(["/bin/sh", "-c", "printf '%s:' \"$GREETING\"; pwd"])
        .env_clear()
        .env("GREETING", "hi")
        .current_dir(dir.path())
        .try_start(Collect(Vec::new(), tx))
        .unwrap();
    assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));

    let out = String::from_utf8(rx.recv_timeout(TIMEOUT).unwrap()).unwrap();
    let expected_dir = dir.path().canonicalize().unwrap();
    assert_eq!(out.trim_end(), format!("hi:{}", expected_dir.display()));
}

#[test]
fn test_spawn_from_callback() {
    let (tx, rx) = mpsc::channel();
    struct Chain(Option<mpsc::Sender<ProcessHandle>>);
    impl ProcessListener for Chain {
        fn on_exit(&mut self, _exit_code: i32) {
            if let Some(tx) = self.0.take() {
                let child = ProcessBuilder::new(["/bin/echo", "second"])
                    .try_start(procplex::NullListener)
                    .unwrap();
                tx.send(child).unwrap();
            }
        }
    }

    let first = ProcessBuilder::new(["/bin/true"]).try_start(Chain(Some(tx))).unwrap();
    assert_eq!(first.wait_for_timeout(TIMEOUT), Some(0));
    let second = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(second.wait_for_timeout(TIMEOUT), Some(0));
}

/// Each exit spawns the next link of its chain onto whichever processor is next.
struct Chain {
    pool: ProcessPool,
    remaining: usize,
    done: mpsc::Sender<usize>,
}

impl ProcessListener for Chain {
    fn on_exit(&mut self, _exit_code: i32) {
        if self.remaining == 0 {
            let _ = self.done.send(0);
            return;
        }
        let next = Chain {
            pool: self.pool.clone(),
            remaining: self.remaining - 1,
            done: self.done.clone(),
        };
        if ProcessBuilder::new(["/bin/true"]).pool(self.pool.clone()).try_start(next).is_err() {
            let _ = self.done.send(self.remaining);
        }
    }
}

#[test]
fn test_processors_spawning_onto_each_other() {
    const CHAINS: usize = 16;
    const LINKS: usize = 50;
    let pool = ProcessPool::new(PoolConfig::default().with_threads(2)).unwrap();
    let (tx, rx) = mpsc::channel();

    for _ in 0..CHAINS {
        let chain = Chain {
            pool: pool.clone(),
            remaining: LINKS,
            done: tx.clone(),
        };
        ProcessBuilder::new(["/bin/true"]).pool(pool.clone()).try_start(chain).unwrap();
    }

    for _ in 0..CHAINS {
        let left = rx.recv_timeout(Duration::from_secs(60)).expect("a chain stalled");
        assert_eq!(left, 0);
    }
    let stats = pool.stats();
    assert_eq!(stats.total.registered, (CHAINS * (LINKS + 1)) as u64);
}

#[test]
fn test_invalid_argument_exits_once() {
    let (code, journal) = run_journaled(&["/bin/cat", "/nonexistent/procplex-input"]);
    assert_ne!(code, 0);
    let entries = journal.entries();
    assert_eq!(entries.iter().filter(|e| e.starts_with("exit:")).count(), 1);
    assert!(entries.iter().any(|e| e.starts_with("stderr:") && e.len() > "stderr:".len()));
}

#[test]
fn test_handle_start_with_explicit_environment() {
    let env: HashMap<OsString, OsString> = [("PROCPLEX_VALUE".into(), "42".into())].into_iter().collect();
    let handle = ProcessHandle::start(["/bin/sh", "-c", "test \"$PROCPLEX_VALUE\" = 42 && test -z \"$HOME\""], env, procplex::NullListener)
        .unwrap();
    assert_eq!(handle.wait_for_timeout(TIMEOUT), Some(0));
    assert!(handle.pid() > 0);
}
