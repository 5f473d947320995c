//! The shared set of known drives.
//!
//! The inventory is the only state touched from more than one thread: a
//! backend's hotplug watcher inserts and removes drives while the pipeline
//! reads them. Every mutation happens under a single write lock and is
//! announced to subscribers as a [`DriveEvent`].
use crate::device::{Drive, DriveEvent};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
pub struct Inventory {
    drives: RwLock<BTreeMap<String, Drive>>,
    subscribers: Mutex<Vec<Sender<DriveEvent>>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a channel on which every later change is delivered.
    pub fn subscribe(&self) -> Receiver<DriveEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Inserts or replaces a drive, keyed by [`Drive::key`].
    pub fn insert(&self, drive: Drive) {
        let key = drive.key.clone();
        if let Ok(mut drives) = self.drives.write() {
            drives.insert(key.clone(), drive);
        }
        self.publish(DriveEvent::Added(key));
    }

    /// Removes a drive. Returns the removed record, if it was known.
    pub fn remove(&self, key: &str) -> Option<Drive> {
        let removed = self.drives.write().ok()?.remove(key);
        if removed.is_some() {
            self.publish(DriveEvent::Removed(key.to_string()));
        }
        removed
    }

    /// Applies `f` to the drive in place. Returns false if it is unknown.
    pub fn update(&self, key: &str, f: impl FnOnce(&mut Drive)) -> bool {
        let updated = match self.drives.write() {
            Ok(mut drives) => match drives.get_mut(key) {
                Some(drive) => {
                    f(drive);
                    true
                }
                None => false,
            },
            Err(_) => false,
        };
        if updated {
            self.publish(DriveEvent::Added(key.to_string()));
        }
        updated
    }

    pub fn get(&self, key: &str) -> Option<Drive> {
        self.drives.read().ok()?.get(key).cloned()
    }

    /// Looks a drive up by key, falling back to matching its device path.
    pub fn find(&self, key_or_device: &str) -> Option<Drive> {
        let drives = self.drives.read().ok()?;
        drives.get(key_or_device).cloned().or_else(|| {
            drives
                .values()
                .find(|d| d.device == Path::new(key_or_device))
                .cloned()
        })
    }

    /// A snapshot of all drives, ordered by key.
    pub fn drives(&self) -> Vec<Drive> {
        self.drives
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self
            .drives
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove(&key);
        }
    }

    fn publish(&self, event: DriveEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Drop subscribers whose receiving end has gone away.
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sample_drive;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn insert_and_remove_publish_events() {
        let inventory = Inventory::new();
        let rx = inventory.subscribe();

        inventory.insert(sample_drive("sdb1"));
        assert_eq!(rx.recv().unwrap(), DriveEvent::Added("sdb1".into()));
        assert_eq!(inventory.drives().len(), 1);

        assert!(inventory.remove("sdb1").is_some());
        assert_eq!(rx.recv().unwrap(), DriveEvent::Removed("sdb1".into()));
        assert!(inventory.get("sdb1").is_none());

        // Unknown keys are not announced.
        assert!(inventory.remove("sdb1").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn find_by_key_or_device_path() {
        let inventory = Inventory::new();
        inventory.insert(sample_drive("sdc1"));

        assert_eq!(inventory.find("sdc1").unwrap().key, "sdc1");
        assert_eq!(inventory.find("/dev/sdc1").unwrap().key, "sdc1");
        assert!(inventory.find("/dev/sdz").is_none());
    }

    #[test]
    fn update_changes_record_in_place() {
        let inventory = Inventory::new();
        inventory.insert(sample_drive("sdb1"));
        let updated = inventory.update("sdb1", |d| {
            d.mount = Some(PathBuf::from("/mnt/live"));
            d.free = Some(42);
        });
        assert!(updated);
        let drive = inventory.get("sdb1").unwrap();
        assert_eq!(drive.mount, Some(PathBuf::from("/mnt/live")));
        assert_eq!(drive.free, Some(42));
        assert!(!inventory.update("nope", |_| {}));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let inventory = Arc::new(Inventory::new());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let inventory = inventory.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let key = format!("sd{i}{j}");
                        inventory.insert(sample_drive(&key));
                        let _ = inventory.drives();
                        if j % 2 == 0 {
                            inventory.remove(&key);
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(inventory.drives().len(), 4 * 25);
    }
}
