//! Host environment capabilities.
//!
//! The engine consumes three host-lifecycle signals (memory pressure,
//! background entry, process termination) and a volume free-space query.
//! Neither has a portable source, so both are injected: the embedding
//! application owns a [`LifecycleHub`] and forwards its platform
//! notifications into it, and may supply a [`VolumeStats`] implementation
//! backed by whatever volume API it has. Absence of either degrades
//! eviction responsiveness only.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Host-lifecycle signals the cache tiers react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The host is under memory pressure.
    MemoryPressure,
    /// The application moved to the background.
    BackgroundEntry,
    /// The process is about to terminate.
    Termination,
}

type Hook = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct Subscriptions {
    memory_pressure: Vec<Hook>,
    background_entry: Vec<Hook>,
    termination: Vec<Hook>,
}

/// Fan-out point for host-lifecycle notifications.
///
/// The host calls [`notify`](Self::notify) from wherever its platform
/// delivers the corresponding event; subscribed tiers react synchronously.
pub struct LifecycleHub {
    subs: Mutex<Subscriptions>,
}

impl LifecycleHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(Subscriptions::default()),
        })
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn notify(&self, event: LifecycleEvent) {
        // Hooks are invoked outside the subscription lock so a hook may
        // subscribe or notify without deadlocking.
        let hooks: Vec<Hook> = {
            let mut subs = self.subs.lock();
            let list = match event {
                LifecycleEvent::MemoryPressure => &mut subs.memory_pressure,
                LifecycleEvent::BackgroundEntry => &mut subs.background_entry,
                LifecycleEvent::Termination => &mut subs.termination,
            };
            std::mem::take(list)
        };
        for hook in &hooks {
            hook();
        }
        let mut subs = self.subs.lock();
        let list = match event {
            LifecycleEvent::MemoryPressure => &mut subs.memory_pressure,
            LifecycleEvent::BackgroundEntry => &mut subs.background_entry,
            LifecycleEvent::Termination => &mut subs.termination,
        };
        // Hooks registered while notifying land after the restored set.
        let mut restored = hooks;
        restored.append(list);
        *list = restored;
    }

    pub(crate) fn subscribe(&self, event: LifecycleEvent, hook: Hook) {
        let mut subs = self.subs.lock();
        match event {
            LifecycleEvent::MemoryPressure => subs.memory_pressure.push(hook),
            LifecycleEvent::BackgroundEntry => subs.background_entry.push(hook),
            LifecycleEvent::Termination => subs.termination.push(hook),
        }
    }
}

/// Volume capacity query, injected by the host.
///
/// Used by the disk tier's free-space trim; returning `None` disables it.
pub trait VolumeStats: Send + Sync {
    /// Available bytes on the volume containing `path`, if known.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Default implementation reporting nothing.
pub struct NoVolumeStats;

impl VolumeStats for NoVolumeStats {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hub_delivers_to_subscribers() {
        let hub = LifecycleHub::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            hub.subscribe(
                LifecycleEvent::MemoryPressure,
                Box::new(move || {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        hub.notify(LifecycleEvent::MemoryPressure);
        assert_eq!(fired.load(Ordering::Relaxed), 3);

        // Other events do not cross-fire.
        hub.notify(LifecycleEvent::BackgroundEntry);
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_hub_survives_repeat_notifications() {
        let hub = LifecycleHub::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        hub.subscribe(
            LifecycleEvent::Termination,
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        hub.notify(LifecycleEvent::Termination);
        hub.notify(LifecycleEvent::Termination);
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_no_volume_stats() {
        assert!(NoVolumeStats
            .available_space(Path::new("/"))
            .is_none());
    }
}
