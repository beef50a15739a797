//! Hot-plug discovery of EVB1000 boards.
//!
//! The [`PortWatcher`] is polled on a fixed cadence. Each poll enumerates the
//! serial ports that are present right now, keeps those whose USB ids are in
//! the [`AllowList`], and diffs them against the ports seen on the previous
//! poll.

use crate::allow_list::AllowList;

use log::warn;
use serialport::SerialPortType;
use std::{
    collections::HashSet,
    hash::{Hash, Hasher},
};

/// A serial port belonging to a USB device. Two descriptors are the same
/// port if they have the same path, whatever their ids say.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
}

impl PortDescriptor {
    /// Describes the port at `path` belonging to the USB device `vid:pid`.
    pub fn new(path: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            path: path.into(),
            vid,
            pid,
        }
    }
}

impl PartialEq for PortDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for PortDescriptor {}

impl Hash for PortDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Something that can list the USB serial ports currently present.
pub trait PortEnumerator: Send {
    /// Every USB serial port present right now. This is best effort, a
    /// failing enumeration just reports no ports.
    fn ports(&mut self) -> Vec<PortDescriptor>;
}

impl<E: PortEnumerator + ?Sized> PortEnumerator for Box<E> {
    fn ports(&mut self) -> Vec<PortDescriptor> {
        (**self).ports()
    }
}

/// Enumerates the serial ports known to the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn ports(&mut self) -> Vec<PortDescriptor> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter_map(|p| match p.port_type {
                    SerialPortType::UsbPort(usb) => {
                        Some(PortDescriptor::new(p.port_name, usb.vid, usb.pid))
                    }
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}

/// What changed between two polls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PortChanges {
    /// Ports present now that were not present before
    pub appeared: Vec<PortDescriptor>,
    /// Ports present before that are gone now
    pub disappeared: Vec<PortDescriptor>,
}

impl PortChanges {
    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

/// Keeps track of the allow-listed ports that are currently connected.
pub struct PortWatcher<E: PortEnumerator> {
    allow_list: AllowList,
    enumerator: E,
    // insertion ordered so changes come out in enumeration order
    known: Vec<PortDescriptor>,
}

impl<E: PortEnumerator> PortWatcher<E> {
    /// Builds a watcher that has not seen any port yet.
    pub fn new(allow_list: AllowList, enumerator: E) -> Self {
        Self {
            allow_list,
            enumerator,
            known: Vec::new(),
        }
    }

    /// The allow-listed ports seen on the last poll.
    pub fn known(&self) -> Vec<PortDescriptor> {
        self.known.clone()
    }

    /// Drops `path` from the known set, so the next poll reports it as a new
    /// appearance if it is still there.
    pub fn forget(&mut self, path: &str) {
        self.known.retain(|p| p.path != path);
    }

    /// Enumerates ports once and reports what appeared and what disappeared
    /// since the previous call.
    pub fn poll(&mut self) -> PortChanges {
        let mut seen = HashSet::new();
        let candidates: Vec<PortDescriptor> = self
            .enumerator
            .ports()
            .into_iter()
            .filter(|p| self.allow_list.contains(p.vid, p.pid))
            .filter(|p| seen.insert(p.path.clone()))
            .collect();

        let known: HashSet<&PortDescriptor> = self.known.iter().collect();
        let appeared = candidates
            .iter()
            .filter(|p| !known.contains(p))
            .cloned()
            .collect();

        let current: HashSet<&PortDescriptor> = candidates.iter().collect();
        let disappeared = self
            .known
            .iter()
            .filter(|p| !current.contains(p))
            .cloned()
            .collect();

        self.known = candidates;

        PortChanges {
            appeared,
            disappeared,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allow_list::VidPid;
    use std::sync::{Arc, Mutex};

    /// A port list that tests can change under the watcher's feet.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakePorts(pub Arc<Mutex<Vec<PortDescriptor>>>);

    impl FakePorts {
        pub fn set(&self, ports: Vec<PortDescriptor>) {
            *self.0.lock().unwrap() = ports;
        }
    }

    impl PortEnumerator for FakePorts {
        fn ports(&mut self) -> Vec<PortDescriptor> {
            self.0.lock().unwrap().clone()
        }
    }

    pub(crate) fn ftdi_only() -> AllowList {
        AllowList::new(vec![VidPid {
            vid: 0x0403,
            pid: 0x6001,
        }])
        .unwrap()
    }

    fn paths(ports: &[PortDescriptor]) -> Vec<&str> {
        ports.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn first_poll_reports_present_ports() {
        let ports = FakePorts::default();
        ports.set(vec![
            PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001),
            PortDescriptor::new("/dev/ttyUSB1", 0x0403, 0x6001),
        ]);
        let mut watcher = PortWatcher::new(ftdi_only(), ports);

        let changes = watcher.poll();
        assert_eq!(paths(&changes.appeared), vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        assert!(changes.disappeared.is_empty());
        assert_eq!(watcher.known().len(), 2);
    }

    #[test]
    fn unchanged_poll_is_empty() {
        let ports = FakePorts::default();
        ports.set(vec![PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001)]);
        let mut watcher = PortWatcher::new(ftdi_only(), ports);

        assert!(!watcher.poll().is_empty());
        assert!(watcher.poll().is_empty());
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn appear_then_disappear() {
        let ports = FakePorts::default();
        let mut watcher = PortWatcher::new(ftdi_only(), ports.clone());
        let port = PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001);

        assert!(watcher.poll().is_empty());

        ports.set(vec![port.clone()]);
        let changes = watcher.poll();
        assert_eq!(changes.appeared, vec![port.clone()]);
        assert!(changes.disappeared.is_empty());

        assert!(watcher.poll().is_empty());

        ports.set(vec![]);
        let changes = watcher.poll();
        assert!(changes.appeared.is_empty());
        assert_eq!(changes.disappeared, vec![port]);
        assert!(watcher.known().is_empty());
    }

    #[test]
    fn unlisted_ports_are_never_reported() {
        let ports = FakePorts::default();
        let mut watcher = PortWatcher::new(ftdi_only(), ports.clone());

        for (vid, pid) in [(0x10c4, 0xea60), (0x0403, 0x6015), (0x6001, 0x0403)] {
            ports.set(vec![PortDescriptor::new("/dev/ttyUSB9", vid, pid)]);
            assert!(watcher.poll().appeared.is_empty());
        }
        ports.set(vec![]);
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn forgotten_port_appears_again() {
        let ports = FakePorts::default();
        let port = PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001);
        ports.set(vec![port.clone()]);
        let mut watcher = PortWatcher::new(ftdi_only(), ports);
        watcher.poll();

        watcher.forget("/dev/ttyUSB1");
        assert!(watcher.poll().is_empty());

        watcher.forget("/dev/ttyUSB0");
        assert!(watcher.known().is_empty());
        let changes = watcher.poll();
        assert_eq!(changes.appeared, vec![port]);
        assert!(changes.disappeared.is_empty());
    }

    #[test]
    fn duplicates_are_merged_by_path() {
        let ports = FakePorts::default();
        ports.set(vec![
            PortDescriptor::new("COM3", 0x0403, 0x6001),
            PortDescriptor::new("COM3", 0x0403, 0x6001),
        ]);
        let mut watcher = PortWatcher::new(ftdi_only(), ports);

        assert_eq!(paths(&watcher.poll().appeared), vec!["COM3"]);
    }

    #[test]
    fn reconnect_between_polls_is_not_seen() {
        let ports = FakePorts::default();
        let port = PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001);
        ports.set(vec![port.clone()]);
        let mut watcher = PortWatcher::new(ftdi_only(), ports.clone());
        watcher.poll();

        // gone and back on the same path before the next poll
        ports.set(vec![]);
        ports.set(vec![port]);
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn descriptor_identity_is_the_path() {
        assert_eq!(
            PortDescriptor::new("COM1", 1, 2),
            PortDescriptor::new("COM1", 3, 4)
        );
        assert_ne!(
            PortDescriptor::new("COM1", 1, 2),
            PortDescriptor::new("COM2", 1, 2)
        );
    }
}
