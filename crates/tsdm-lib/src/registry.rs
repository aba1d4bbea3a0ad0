//! Named collection of data managers driven together, e.g. the lanes of one
//! chart that share a time axis.

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::executor::{FetchId, QueryExecutor};
use crate::manager::DataManager;
use log::{debug, warn};
use std::collections::HashMap;

/// Handle into a [`Registry`]. Stale once its entry is deregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Option<(String, T)>,
}

#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    names: HashMap<String, ManagerHandle>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            names: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Result<ManagerHandle> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(SyncError::DuplicateManager(name));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.entry = Some((name.clone(), value));
        let handle = ManagerHandle {
            index,
            generation: slot.generation,
        };
        self.names.insert(name, handle);
        Ok(handle)
    }

    pub fn remove(&mut self, handle: ManagerHandle) -> Result<T> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(SyncError::StaleHandle)?;
        let (name, value) = slot.entry.take().ok_or(SyncError::StaleHandle)?;
        self.names.remove(&name);
        self.free.push(handle.index);
        Ok(value)
    }

    pub fn get(&self, handle: ManagerHandle) -> Result<&T> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(_, value)| value)
            .ok_or(SyncError::StaleHandle)
    }

    pub fn get_mut(&mut self, handle: ManagerHandle) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .map(|(_, value)| value)
            .ok_or(SyncError::StaleHandle)
    }

    pub fn handle(&self, name: &str) -> Option<ManagerHandle> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&T> {
        self.handle(name).and_then(|handle| self.get(handle).ok())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.entry.as_mut())
            .map(|(name, value)| (name.as_str(), value))
    }
}

impl<E: QueryExecutor, C: Clock> Registry<DataManager<E, C>> {
    /// Register under the manager's own id.
    pub fn register(&mut self, manager: DataManager<E, C>) -> Result<ManagerHandle> {
        let name = manager.id().to_string();
        debug!("registering data manager {}", name);
        self.insert(name, manager)
    }

    /// Remove and tear down. The handle is stale afterwards.
    pub fn deregister(&mut self, handle: ManagerHandle) -> Result<DataManager<E, C>> {
        let mut manager = self.remove(handle)?;
        if !manager.is_torn_down() {
            manager.teardown()?;
        }
        debug!("deregistered data manager {}", manager.id());
        Ok(manager)
    }

    /// Apply the same window to every manager. Fails on the first invalid window
    /// before touching any manager.
    pub fn window_all(&mut self, min: f64, max: f64) -> Result<()> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(SyncError::InvalidWindow { min, max });
        }
        for (name, manager) in self.iter_mut() {
            if let Err(err) = manager.apply_window(min, max) {
                warn!("{}: {}", name, err);
            }
        }
        Ok(())
    }

    pub fn clear_window_all(&mut self) {
        for (name, manager) in self.iter_mut() {
            if let Err(err) = manager.clear_window() {
                warn!("{}: {}", name, err);
            }
        }
    }

    /// Pump executor callbacks and due timers for every manager. Returns the
    /// fetches that timers dispatched.
    pub fn poll_all(&mut self) -> Vec<FetchId> {
        let mut dispatched = Vec::new();
        for (name, manager) in self.iter_mut() {
            if manager.is_torn_down() {
                continue;
            }
            if let Err(err) = manager.run_until_idle() {
                warn!("{}: {}", name, err);
            }
            match manager.poll_timers() {
                Ok(Some(fetch)) => dispatched.push(fetch),
                Ok(None) => {}
                Err(err) => warn!("{}: {}", name, err),
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ManagerConfig;
    use crate::dataset::{series, TimeSpec};
    use crate::executor::QueryRequest;

    #[derive(Default)]
    struct Silent;

    impl QueryExecutor for Silent {
        fn execute(&mut self, _request: &QueryRequest) -> Result<()> {
            Ok(())
        }

        fn cancel(&mut self, _id: FetchId) {}
    }

    fn lane(id: &str) -> DataManager<Silent, ManualClock> {
        let config = ManagerConfig {
            id: id.into(),
            ..ManagerConfig::default()
        };
        DataManager::with_clock(config, Silent, ManualClock::new()).unwrap()
    }

    #[test]
    fn handles_go_stale_after_removal() {
        let mut registry = Registry::default();
        let a = registry.insert("a", 1).unwrap();
        assert_eq!(
            registry.insert("a", 2).unwrap_err(),
            SyncError::DuplicateManager("a".into())
        );
        assert_eq!(registry.remove(a).unwrap(), 1);
        let b = registry.insert("b", 3).unwrap();
        assert_eq!(registry.get(a).unwrap_err(), SyncError::StaleHandle);
        assert_eq!(*registry.get(b).unwrap(), 3);
        assert_eq!(registry.by_name("b"), Some(&3));
        assert!(registry.by_name("a").is_none());
    }

    #[test]
    fn windows_every_lane() {
        let mut registry = Registry::default();
        let cpu = registry.register(lane("cpu")).unwrap();
        let mem = registry.register(lane("mem")).unwrap();
        for handle in [cpu, mem] {
            let manager = registry.get_mut(handle).unwrap();
            let id = manager
                .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
                .unwrap();
            let data = series(&["_time"], (0..60).map(|i| vec![i as f64 * 60.0]).collect());
            manager.on_result(id, data).unwrap();
        }

        registry.window_all(0.0, 600.0).unwrap();
        assert!(registry.iter().all(|(_, m)| m.rows().len() == 10));
        assert!(registry.window_all(2.0, 1.0).is_err());

        registry.clear_window_all();
        assert!(registry.iter().all(|(_, m)| m.rows().len() == 60));

        let removed = registry.deregister(mem).unwrap();
        assert!(removed.is_torn_down());
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister(mem).is_err());
        assert!(registry.poll_all().is_empty());
    }
}
