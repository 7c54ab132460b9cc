//! Process-wide, reference-counted interpreter start and stop.
//!
//! Every graph or session backed by a script host holds an
//! [`InterpreterLease`]. The first lease initializes the interpreter and
//! dropping the last one finalizes it.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, ScriptError};

/// An embedded interpreter that must be started before use.
pub trait Interpreter: Send + Sync {
    fn initialize(&self) -> Result<()>;
    fn finalize(&self) -> Result<()>;
    fn is_initialized(&self) -> bool;
}

static GLOBAL: OnceCell<Arc<Lifecycle>> = OnceCell::new();

/// Counts the consumers of one interpreter.
pub struct Lifecycle {
    interpreter: Arc<dyn Interpreter>,
    consumers: Mutex<usize>,
}

impl Lifecycle {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Arc<Self> {
        Arc::new(Self {
            interpreter,
            consumers: Mutex::new(0),
        })
    }

    /// Installs the process-wide lifecycle. Fails if one is installed.
    pub fn install(interpreter: Arc<dyn Interpreter>) -> Result<Arc<Self>> {
        let lifecycle = Self::new(interpreter);
        GLOBAL
            .set(lifecycle.clone())
            .map_err(|_| ScriptError::Interpreter("lifecycle already installed".into()))?;
        Ok(lifecycle)
    }

    /// The process-wide lifecycle, if installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Registers a consumer, initializing the interpreter for the first one.
    pub fn acquire(self: &Arc<Self>) -> Result<InterpreterLease> {
        let mut consumers = self.consumers.lock();
        if *consumers == 0 && !self.interpreter.is_initialized() {
            info!("script: initialize interpreter");
            self.interpreter.initialize()?;
        }
        *consumers += 1;
        info!(consumers = *consumers, "script: interpreter acquired");
        Ok(InterpreterLease {
            lifecycle: self.clone(),
        })
    }

    pub fn consumers(&self) -> usize {
        *self.consumers.lock()
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }

    fn release(&self) {
        let mut consumers = self.consumers.lock();
        if *consumers == 1 && self.interpreter.is_initialized() {
            info!("script: finalize interpreter");
            if let Err(err) = self.interpreter.finalize() {
                warn!(%err, "script: interpreter finalize failed");
            }
        }
        *consumers = consumers.saturating_sub(1);
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("consumers", &self.consumers())
            .field("initialized", &self.interpreter.is_initialized())
            .finish()
    }
}

/// One consumer's claim on the interpreter; released on drop.
#[derive(Debug)]
pub struct InterpreterLease {
    lifecycle: Arc<Lifecycle>,
}

impl InterpreterLease {
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }
}

impl Drop for InterpreterLease {
    fn drop(&mut self) {
        self.lifecycle.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingInterpreter {
        running: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
    }

    impl Interpreter for CountingInterpreter {
        fn initialize(&self) -> Result<()> {
            if self.fail_start {
                return Err(ScriptError::Interpreter("no interpreter".into()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn finalize(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn first_acquire_initializes_last_release_finalizes() {
        let interp = Arc::new(CountingInterpreter::default());
        let lifecycle = Lifecycle::new(interp.clone());

        let a = lifecycle.acquire().unwrap();
        let b = lifecycle.acquire().unwrap();
        assert_eq!(lifecycle.consumers(), 2);
        assert_eq!(interp.starts.load(Ordering::SeqCst), 1);

        drop(a);
        assert!(interp.is_initialized());
        assert_eq!(interp.stops.load(Ordering::SeqCst), 0);

        drop(b);
        assert!(!interp.is_initialized());
        assert_eq!(interp.stops.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.consumers(), 0);

        let _c = lifecycle.acquire().unwrap();
        assert_eq!(interp.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn already_running_interpreter_is_not_restarted() {
        let interp = Arc::new(CountingInterpreter::default());
        interp.running.store(true, Ordering::SeqCst);
        let lifecycle = Lifecycle::new(interp.clone());

        let lease = lifecycle.acquire().unwrap();
        assert_eq!(interp.starts.load(Ordering::SeqCst), 0);
        drop(lease);
        assert_eq!(interp.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_initialize_registers_no_consumer() {
        let interp = Arc::new(CountingInterpreter {
            fail_start: true,
            ..Default::default()
        });
        let lifecycle = Lifecycle::new(interp);
        assert!(lifecycle.acquire().is_err());
        assert_eq!(lifecycle.consumers(), 0);
    }

    #[test]
    fn concurrent_consumers_start_once() {
        let interp = Arc::new(CountingInterpreter::default());
        let lifecycle = Lifecycle::new(interp.clone());
        let holder = lifecycle.acquire().unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let lifecycle = &lifecycle;
                s.spawn(move || {
                    for _ in 0..100 {
                        let _lease = lifecycle.acquire().unwrap();
                    }
                });
            }
        });

        assert_eq!(interp.starts.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.consumers(), 1);
        drop(holder);
        assert_eq!(interp.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn global_install_happens_once() {
        let _ = Lifecycle::install(Arc::new(CountingInterpreter::default()));
        assert!(Lifecycle::global().is_some());
        let again = Lifecycle::install(Arc::new(CountingInterpreter::default()));
        assert!(again.is_err());
    }
}
