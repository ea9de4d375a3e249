//! # Process lifecycle context
//!
//! Long-lived components (the vmrest supervisor today) need two things from
//! the process owning them: a way to register cleanup work that must run on
//! termination, and a signal telling them the process is going away. Both are
//! carried by a [Lifecycle] which is created once by the service and handed
//! to the components at construction.
//!
//! ```rust
//! use vmware_desktop_utility::lifecycle::Lifecycle;
//!
//! let lifecycle = Lifecycle::new();
//! lifecycle.on_shutdown("say goodbye", || println!("goodbye"));
//! lifecycle.shutdown();
//! assert!(lifecycle.is_shutdown());
//! ```
use std::{fmt, sync::Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

type Hook = Box<dyn FnOnce() + Send>;

pub struct Lifecycle {
    hooks: Mutex<Vec<(String, Hook)>>,
    cancel: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        let (cancel, _) = watch::channel(false);
        Lifecycle {
            hooks: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Register a cleanup callback. Callbacks run once, last registered
    /// first. Registering after shutdown runs the callback right away.
    pub fn on_shutdown<F>(&self, name: &str, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            debug!("Lifecycle already shut down, running hook {} now", name);
            hook();
            return;
        }
        debug!("Registering shutdown hook {}", name);
        let mut hooks = match self.hooks.lock() {
            Ok(hooks) => hooks,
            Err(poisoned) => poisoned.into_inner(),
        };
        hooks.push((name.to_string(), Box::new(hook)));
    }

    /// Receiver flipping to `true` once [Lifecycle::shutdown] is called
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Cancel every subscriber then run the registered hooks
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.cancel.send_replace(true);
        let hooks = {
            let mut hooks = match self.hooks.lock() {
                Ok(hooks) => hooks,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *hooks)
        };
        for (name, hook) in hooks.into_iter().rev() {
            debug!("Running shutdown hook {}", name);
            hook();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks: Vec<String> = match self.hooks.lock() {
            Ok(hooks) => hooks.iter().map(|(name, _)| name.clone()).collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("Lifecycle")
            .field("hooks", &hooks)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
