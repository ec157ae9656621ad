//! Signal-coordinated cleanup
//!
//! One coordinator value, owned by the entry point, tracks interrupt
//! attempts and the cleanup state machine (`idle -> in_progress ->
//! complete`). Interrupts are progressive: the first begins a graceful
//! shutdown (the pipeline stops at the next phase boundary), the second
//! through fourth only report progress, and the fifth exits immediately.
//!
//! Cleanup removes the habitat's build containers and dangling images, but
//! only when this is the last live process of this program; concurrent
//! invocations would otherwise race on the shared image store. Per-item
//! failures are logged and skipped; cleanup never fails a build.

use crate::progress::{ProgressEvent, ProgressObserver};
use crate::runtime::ContainerRuntime;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interrupts tolerated before the process exits immediately
pub const MAX_INTERRUPTS: u32 = 5;

const STATE_IDLE: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_COMPLETE: u8 = 2;

/// Observable cleanup state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    Idle,
    InProgress,
    Complete,
}

/// What a cleanup invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Containers and images removed
    Done {
        containers_removed: usize,
        images_removed: usize,
    },
    /// Another process of this program is still alive; nothing was touched
    SkippedPeers { peers: usize },
    /// A cleanup is already running or already ran
    Observed(CleanupState),
}

type PeerProbe = dyn Fn() -> usize + Send + Sync;

/// Process-wide cleanup coordinator
pub struct CleanupCoordinator {
    state: AtomicU8,
    interrupts: AtomicU32,
    peer_probe: Box<PeerProbe>,
}

static SIGNAL_HANDLER_INSTALLED: OnceCell<()> = OnceCell::new();

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            interrupts: AtomicU32::new(0),
            peer_probe: Box::new(count_peer_processes),
        }
    }

    /// Replace the peer-process probe (tests)
    pub fn with_peer_probe<F: Fn() -> usize + Send + Sync + 'static>(probe: F) -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            interrupts: AtomicU32::new(0),
            peer_probe: Box::new(probe),
        }
    }

    /// Install the interrupt handler. Only the first call per process
    /// installs anything; later calls are no-ops.
    pub fn install_signal_handler(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        SIGNAL_HANDLER_INSTALLED.get_or_init(move || {
            let result = ctrlc::set_handler(move || {
                coordinator.record_interrupt();
            });
            if let Err(e) = result {
                warn!("Could not install signal handler: {}", e);
            }
        });
    }

    /// Count one interrupt and react per the progressive policy. Exposed
    /// for tests; the installed signal handler calls this.
    pub fn record_interrupt(&self) {
        let count = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        match count {
            1 => {
                eprintln!("Interrupt received; shutting down gracefully...");
            }
            2..=4 => {
                eprintln!(
                    "shutdown in progress, {} more times to force exit",
                    MAX_INTERRUPTS - count
                );
            }
            _ => {
                eprintln!("Forced exit.");
                std::process::exit(1);
            }
        }
    }

    /// Whether at least one interrupt arrived; the pipeline polls this at
    /// phase boundaries
    pub fn interrupted(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst) > 0
    }

    /// Number of interrupts seen so far
    pub fn interrupt_count(&self) -> u32 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Current state of the cleanup state machine
    pub fn state(&self) -> CleanupState {
        match self.state.load(Ordering::SeqCst) {
            STATE_IN_PROGRESS => CleanupState::InProgress,
            STATE_COMPLETE => CleanupState::Complete,
            _ => CleanupState::Idle,
        }
    }

    /// Remove this habitat's build containers and dangling images.
    ///
    /// Proceeds only when this process is the last one of its program name,
    /// unless `force`. Only one cleanup may run; concurrent entries observe
    /// the state and return. Completed cleanups are not repeated, which
    /// makes back-to-back invocations equivalent to one.
    pub async fn run<R: ContainerRuntime>(
        &self,
        runtime: &R,
        habitat_prefix: &str,
        force: bool,
        observer: &dyn ProgressObserver,
    ) -> CleanupOutcome {
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_IN_PROGRESS,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(_) => return CleanupOutcome::Observed(self.state()),
        }

        if !force {
            let peers = (self.peer_probe)();
            if peers > 0 {
                debug!(peers, "Peer processes alive; leaving shared state alone");
                self.state.store(STATE_IDLE, Ordering::SeqCst);
                return CleanupOutcome::SkippedPeers { peers };
            }
        }

        observer.on_event(&ProgressEvent::cleanup_begin());
        info!(prefix = habitat_prefix, "Cleaning up containers and dangling images");

        let mut containers_removed = 0;
        match runtime.list_containers(habitat_prefix).await {
            Ok(containers) => {
                for container in containers {
                    if let Err(e) = runtime.remove(&container).await {
                        warn!(container = %container, "Could not remove container: {}", e);
                        continue;
                    }
                    containers_removed += 1;
                }
            }
            Err(e) => warn!("Could not enumerate containers: {}", e),
        }

        let mut images_removed = 0;
        match runtime.dangling_images().await {
            Ok(images) => {
                for image in images {
                    if let Err(e) = runtime.remove_image(&image).await {
                        warn!(image = %image, "Could not remove image: {}", e);
                        continue;
                    }
                    images_removed += 1;
                }
            }
            Err(e) => warn!("Could not enumerate dangling images: {}", e),
        }

        self.state.store(STATE_COMPLETE, Ordering::SeqCst);
        observer.on_event(&ProgressEvent::cleanup_end(containers_removed, images_removed));
        CleanupOutcome::Done {
            containers_removed,
            images_removed,
        }
    }
}

/// Live processes sharing our executable name, excluding this one
fn count_peer_processes() -> usize {
    use sysinfo::{ProcessesToUpdate, System};

    let Some(my_name) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
    else {
        return 0;
    };
    let me = sysinfo::get_current_pid().ok();

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .filter(|(pid, process)| Some(**pid) != me && process.name() == my_name.as_os_str())
        .count()
}
