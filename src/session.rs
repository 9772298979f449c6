// One CP/M session per connection: its own Machine on a dedicated OS
// thread, reachable only through the small handle the registry hands out.
// Session-local state (CPU, memory, disk, open files) never crosses the
// thread boundary; the registry's mutex guards the map of handles, never
// a running session's internals.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::machine::Machine;
use crate::terminal::Terminal;

pub type SessionId = u64;

/// Extracts a human-readable message from a panic payload, for the
/// `"System error: <message>"` line a session reports before ending.
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error".to_string()
    }
}

/// A FIFO byte queue with single-permit-per-character delivery:
/// `read_char` blocks until exactly one byte is available, the way a
/// real console hands a guest program one keystroke at a time rather
/// than a batch.
#[derive(Default)]
struct InputQueue {
    queue: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl InputQueue {
    fn push(&self, byte: u8) {
        self.queue.lock().unwrap().push_back(byte);
        self.ready.notify_one();
    }

    fn has_input(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Blocks until a byte is available or `shutdown` flips, in which
    /// case it returns a CR so a blocked line-reader (CCP's prompt, BDOS
    /// function 10) terminates its read instead of spinning forever on
    /// repeated shutdown-sentinel bytes.
    fn pop_blocking(&self, shutdown: &AtomicBool) -> u8 {
        let mut guard = self.queue.lock().unwrap();
        loop {
            if let Some(byte) = guard.pop_front() {
                return byte;
            }
            if shutdown.load(Ordering::SeqCst) {
                return b'\r';
            }
            let (next, timeout) =
                self.ready.wait_timeout(guard, std::time::Duration::from_millis(50)).unwrap();
            guard = next;
            let _ = timeout;
        }
    }
}

/// The `Terminal` a session's Machine reads from and writes through.
/// Input arrives via `push_input` from whatever transport owns the
/// session; output is forwarded to a sink closure so the same transport
/// can stream it back out. Both sides only ever touch the shared queue
/// through `Arc`, never the Machine itself.
pub struct SessionTerminal {
    input: Arc<InputQueue>,
    shutdown: Arc<AtomicBool>,
    sink: Box<dyn FnMut(u8) + Send>,
}

impl Terminal for SessionTerminal {
    fn has_input(&mut self) -> bool {
        self.input.has_input() || self.shutdown.load(Ordering::SeqCst)
    }

    fn read_char(&mut self) -> u8 {
        self.input.pop_blocking(&self.shutdown)
    }

    fn write_char(&mut self, byte: u8) {
        (self.sink)(byte);
    }
}

/// A handle to a running session: push input in, request shutdown, join
/// on completion.
pub struct SessionHandle {
    id: SessionId,
    input: Arc<InputQueue>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Feeds one byte of guest input, e.g. a keystroke from whatever
    /// transport owns this session.
    pub fn push_input(&self, byte: u8) {
        self.input.push(byte);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Blocks until the session's thread has finished. Safe to call after
    /// `request_shutdown`; idempotent if already joined.
    pub fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// The set of sessions currently running. The mutex is held only for the
/// instant it takes to insert or remove a handle — never while a session
/// is executing — so one session blocking on its own terminal can never
/// stall another.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry { sessions: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Spawns a new session on its own thread. `sink` receives every byte
    /// the guest writes to its console; `configure` runs against the
    /// session's `Machine` before `start()` (registering transient
    /// programs, preloading disk files) while still on the session's own
    /// thread, since `Machine` is not `Send`.
    pub fn spawn<F>(&self, sink: Box<dyn FnMut(u8) + Send>, configure: F) -> SessionId
    where
        F: FnOnce(&mut Machine<'static>) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let input = Arc::new(InputQueue::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_input = input.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name(format!("cpm-session-{id}"))
            .spawn(move || {
                info!(session = id, "session starting");
                let terminal = SessionTerminal {
                    input: thread_input,
                    shutdown: thread_shutdown.clone(),
                    sink,
                };
                let terminal: std::rc::Rc<std::cell::RefCell<dyn Terminal>> =
                    std::rc::Rc::new(std::cell::RefCell::new(terminal));
                let terminal_for_errors = terminal.clone();
                // Share this thread's own shutdown flag with the Machine
                // rather than letting it allocate a private one: that's the
                // only way `SessionHandle::request_shutdown` can actually
                // reach `Machine::start`'s loop and `run_com_file`'s step
                // loop from outside this thread.
                let mut machine = Machine::with_shutdown(terminal, thread_shutdown.clone());
                configure(&mut machine);
                if thread_shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| machine.start()));
                if let Err(payload) = outcome {
                    let message = panic_message(&payload);
                    terminal_for_errors.borrow_mut().write_line(&format!("System error: {message}"));
                    warn!(session = id, %message, "session ended on an uncaught failure");
                }
                info!(session = id, "session stopped");
            })
            .expect("failed to spawn session thread");

        let handle = SessionHandle { id, input, shutdown, join: Some(join) };
        self.sessions.lock().unwrap().insert(id, handle);
        id
    }

    pub fn push_input(&self, id: SessionId, byte: u8) -> bool {
        match self.sessions.lock().unwrap().get(&id) {
            Some(handle) => {
                handle.push_input(byte);
                true
            }
            None => {
                warn!(session = id, "push_input to unknown session");
                false
            }
        }
    }

    /// Requests shutdown and removes the session from the registry,
    /// joining its thread outside the lock so a slow-to-stop session
    /// can't block other registry operations.
    pub fn remove(&self, id: SessionId) {
        let handle = self.sessions.lock().unwrap().remove(&id);
        if let Some(mut handle) = handle {
            handle.request_shutdown();
            handle.join();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawned_session_can_be_shutdown_and_removed() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel::<u8>();
        let id = registry.spawn(
            Box::new(move |b| {
                let _ = tx.send(b);
            }),
            |_machine| {},
        );
        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn session_reports_system_error_on_panic_and_still_joins() {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel::<u8>();
        let id = registry.spawn(
            Box::new(move |b| {
                let _ = tx.send(b);
            }),
            |machine| {
                machine.register_program(
                    "BOOM",
                    Box::new(|_disk, _term, _args| panic!("boom")),
                );
            },
        );
        for byte in b"BOOM\r" {
            registry.push_input(id, *byte);
        }
        registry.remove(id);
        assert!(registry.is_empty());

        let output: Vec<u8> = rx.try_iter().collect();
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("System error:"), "got: {text:?}");
    }

    #[test]
    fn push_input_to_unknown_session_reports_failure() {
        let registry = SessionRegistry::new();
        assert!(!registry.push_input(9999, b'x'));
    }

    #[test]
    fn input_queue_delivers_bytes_fifo() {
        let queue = InputQueue::default();
        let shutdown = AtomicBool::new(false);
        queue.push(b'A');
        queue.push(b'B');
        assert_eq!(queue.pop_blocking(&shutdown), b'A');
        assert_eq!(queue.pop_blocking(&shutdown), b'B');
    }

    #[test]
    fn input_queue_unblocks_on_shutdown() {
        let queue = InputQueue::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            thread_shutdown.store(true, Ordering::SeqCst);
        });
        assert_eq!(queue.pop_blocking(&shutdown), b'\r');
    }
}
