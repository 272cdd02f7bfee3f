//! Heuristic discovery of the just-inserted block device.
//!
//! The user plugs in a card after the tool starts listening; no device name
//! is ever passed on the command line. Add and change events are tallied per
//! device over an observation window that closes after one second of idle,
//! and the tally is disambiguated into a candidate set. Candidates whose
//! block size reads back as zero are discarded and observation restarts, so
//! card readers that fire events without media never win.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::executor::{CommandExecutor, CommandSpec};
use crate::interrupt;
use crate::sysfs;
use crate::uevent::{EventAction, EventSource, HotplugEvent};

/// Idle interval after which an observation window closes.
pub const IDLE_WINDOW: Duration = Duration::from_secs(1);

/// A block device that survived discovery, with everything the executor and
/// the user selection dialog need to know about it.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    /// Kernel name (e.g., `mmcblk0`).
    pub name: String,
    /// /dev node path.
    pub path: Utf8PathBuf,
    /// Whole-device size in bytes.
    pub size_bytes: u64,
    /// Existing partition table type, when one is readable.
    pub table_type: Option<String>,
    /// /dev node paths of existing child partitions.
    pub partitions: Vec<Utf8PathBuf>,
}

/// Per-device add/change event counts for one observation window.
#[derive(Debug, Default)]
pub struct EventTally {
    added: BTreeMap<String, u32>,
    changed: BTreeMap<String, u32>,
}

impl EventTally {
    /// Records one event into the tally.
    pub fn record(&mut self, event: &HotplugEvent) {
        let bucket = match event.action {
            EventAction::Add => &mut self.added,
            EventAction::Change => &mut self.changed,
        };
        *bucket.entry(event.device.clone()).or_insert(0) += 1;
    }

    /// Returns true if no event has been recorded.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }

    /// Disambiguates the tally into candidate device names.
    ///
    /// The cases, in order:
    /// 1. no add events: every device that fired a change event;
    /// 2. no change events: every device that fired an add event;
    /// 3. all add counts equal and the add/change key sets match: the devices
    ///    with the maximum add count (ties kept);
    /// 4. all add counts equal, key sets differ: devices that only fired add;
    /// 5. otherwise the counts fit no known insertion pattern, so every
    ///    involved device is surfaced rather than silently guessed.
    pub fn candidates(&self) -> Vec<String> {
        debug!("add/change event statistics: add={:?} change={:?}", self.added, self.changed);

        if self.added.is_empty() {
            return self.changed.keys().cloned().collect();
        }
        if self.changed.is_empty() {
            return self.added.keys().cloned().collect();
        }

        let mut add_counts = self.added.values();
        let first = *add_counts.next().expect("added is non-empty");
        if add_counts.all(|&count| count == first) {
            let add_keys: Vec<&String> = self.added.keys().collect();
            let change_keys: Vec<&String> = self.changed.keys().collect();

            if add_keys == change_keys {
                let maximum = *self.added.values().max().expect("added is non-empty");
                return self
                    .added
                    .iter()
                    .filter(|&(_, &count)| count == maximum)
                    .map(|(name, _)| name.clone())
                    .collect();
            }

            return self
                .added
                .keys()
                .filter(|name| !self.changed.contains_key(*name))
                .cloned()
                .collect();
        }

        warn!("events do not match any known insertion pattern; surfacing all involved devices");
        let mut union: Vec<String> = self.added.keys().chain(self.changed.keys()).cloned().collect();
        union.sort();
        union.dedup();
        union
    }
}

/// Collects one observation window of events.
///
/// Blocks until the first relevant event arrives (checking for user
/// interrupts once per idle interval), then keeps collecting until the
/// source stays quiet for a full [`IDLE_WINDOW`].
pub fn observe(source: &mut dyn EventSource) -> Result<EventTally> {
    let mut tally = EventTally::default();

    loop {
        interrupt::check_interrupt()?;
        match source.next_event(IDLE_WINDOW)? {
            Some(event) => {
                tally.record(&event);
                break;
            }
            None => continue,
        }
    }

    while let Some(event) = source.next_event(IDLE_WINDOW)? {
        tally.record(&event);
    }

    Ok(tally)
}

/// Observes hotplug events until at least one candidate with a real block
/// size remains, and returns the surviving candidate names.
pub fn discover<F>(source: &mut dyn EventSource, size_of: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> u64,
{
    loop {
        let tally = observe(source)?;
        let mut survivors = Vec::new();

        for name in tally.candidates() {
            if size_of(&name) != 0 {
                debug!("device {} has a non-zero size, keeping as candidate", name);
                survivors.push(name);
            } else {
                debug!("dropping zero-sized candidate {}", name);
            }
        }

        if !survivors.is_empty() {
            return Ok(survivors);
        }
        debug!("no real block device among candidates, re-observing");
    }
}

/// Builds full [`DeviceCandidate`] records for the surviving names.
///
/// Sizes and partitions come from sysfs; the existing partition table type is
/// read through `blkid` and tolerated missing (a brand-new card has none).
pub fn inspect_candidates(
    names: &[String],
    sysfs_root: &Utf8Path,
    executor: &dyn CommandExecutor,
) -> Vec<DeviceCandidate> {
    names
        .iter()
        .map(|name| {
            let path = sysfs::device_node(name);
            let partitions = sysfs::partition_names(sysfs_root, name)
                .iter()
                .map(|child| sysfs::device_node(child))
                .collect();

            DeviceCandidate {
                name: name.clone(),
                path: path.clone(),
                size_bytes: sysfs::device_size_bytes(sysfs_root, name),
                table_type: read_table_type(&path, executor),
                partitions,
            }
        })
        .collect()
}

fn read_table_type(device: &Utf8Path, executor: &dyn CommandExecutor) -> Option<String> {
    let spec = CommandSpec::new("blkid", ["-o", "value", "-s", "PTTYPE", device.as_str()]);
    match executor.capture(&spec) {
        Ok(output) if output.success() && !output.value().is_empty() => {
            Some(output.value().to_string())
        }
        Ok(_) => None,
        Err(e) => {
            debug!("could not read partition table type of {}: {}", device, e);
            None
        }
    }
}
