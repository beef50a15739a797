//! Owns every [`DeviceSession`] and keeps the set of sessions in step with
//! the boards that are plugged in.
//!
//! A background thread polls a [`PortWatcher`], spawns a session for every
//! port that appears and stops the session of every port that disappears.
//! Consumers learn about changes through [`Event`]s and then pull the details
//! from the manager, so a missed event never loses the latest state.

use crate::allow_list::AllowList;
use crate::hardware_message_decoder::Record;
use crate::port_watcher::{PortDescriptor, PortEnumerator, PortWatcher, SystemPorts};
use crate::session::{DeviceSession, SessionId};
use crate::transport::{SerialTransport, Transport, DEFAULT_BAUD_RATE};

use log::info;
use std::{
    collections::HashMap,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Default time between two port polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// How often the watcher wakes up to check whether it should exit.
const STOP_CHECK: Duration = Duration::from_millis(20);

/// Builds the transport for a newly appeared port.
pub type TransportFactory = Box<dyn Fn(&PortDescriptor) -> Box<dyn Transport> + Send>;

/// Notifications sent by the manager and its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// New sessions are waiting in [`DeviceManager::take_new_devices`]
    DevicesConnected,
    /// Stopped sessions are waiting in [`DeviceManager::take_removed_devices`]
    DevicesRemoved,
    /// The session has a new [`DeviceSession::last_record`]
    NewData(SessionId),
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<SessionId, DeviceSession>,
    new_devices: Vec<DeviceSession>,
    removed_devices: Vec<DeviceSession>,
    // stopped but maybe still inside a read, joined on shutdown
    retired: Vec<DeviceSession>,
}

impl Registry {
    fn remove_port(&mut self, port: &PortDescriptor) -> Option<DeviceSession> {
        let id = self
            .sessions
            .keys()
            .find(|id| id.path() == port.path)
            .cloned()?;
        self.sessions.remove(&id)
    }

    // Retires sessions whose read loop gave up on its own, e.g. because the
    // port could not be opened.
    fn remove_stopped(&mut self) -> Vec<DeviceSession> {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_running())
            .map(|(id, _)| id.clone())
            .collect();

        let mut stopped = Vec::new();
        for id in ids {
            if let Some(session) = self.sessions.remove(&id) {
                self.removed_devices.push(session.clone());
                self.retired.push(session.clone());
                stopped.push(session);
            }
        }
        stopped
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configures a [`DeviceManager`]. By default ports are enumerated from the
/// OS and opened as serial ports at 115200 baud.
pub struct DeviceManagerBuilder {
    allow_list: AllowList,
    enumerator: Box<dyn PortEnumerator>,
    transport_factory: TransportFactory,
    poll_interval: Duration,
}

impl DeviceManagerBuilder {
    /// Use another source of ports.
    pub fn enumerator(mut self, enumerator: impl PortEnumerator + 'static) -> Self {
        self.enumerator = Box::new(enumerator);
        self
    }

    /// Use another kind of transport.
    pub fn transport_factory(
        mut self,
        factory: impl Fn(&PortDescriptor) -> Box<dyn Transport> + Send + 'static,
    ) -> Self {
        self.transport_factory = Box::new(factory);
        self
    }

    /// Open serial ports at `baud_rate` instead of the default.
    pub fn baud_rate(self, baud_rate: u32) -> Self {
        self.transport_factory(move |port: &PortDescriptor| -> Box<dyn Transport> {
            Box::new(SerialTransport::new(&port.path, baud_rate))
        })
    }

    /// Time between two port polls.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Starts the watcher thread. The receiver gets every [`Event`]; dropping
    /// it makes the watcher exit after its next poll.
    pub fn start(self) -> (DeviceManager, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let running = Arc::new(AtomicBool::new(true));

        let watcher = PortWatcher::new(self.allow_list, self.enumerator);
        let th_registry = Arc::clone(&registry);
        let th_running = Arc::clone(&running);
        let factory = self.transport_factory;
        let poll_interval = self.poll_interval;

        let handle = thread::spawn(move || {
            watch_ports(watcher, factory, poll_interval, th_registry, th_running, tx)
        });

        let manager = DeviceManager {
            registry,
            running,
            handle: Some(handle),
        };
        (manager, rx)
    }
}

/// Handle on the background device management. Stopping it (explicitly or
/// by dropping it) stops every session.
pub struct DeviceManager {
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceManager {
    /// Start configuring a manager for the boards in `allow_list`.
    pub fn builder(allow_list: AllowList) -> DeviceManagerBuilder {
        DeviceManagerBuilder {
            allow_list,
            enumerator: Box::new(SystemPorts),
            transport_factory: Box::new(|port: &PortDescriptor| -> Box<dyn Transport> {
                Box::new(SerialTransport::new(&port.path, DEFAULT_BAUD_RATE))
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sessions started since the last call.
    pub fn take_new_devices(&self) -> Vec<DeviceSession> {
        mem::take(&mut lock(&self.registry).new_devices)
    }

    /// Sessions stopped since the last call.
    pub fn take_removed_devices(&self) -> Vec<DeviceSession> {
        mem::take(&mut lock(&self.registry).removed_devices)
    }

    /// Looks up a live session. Sessions disappear as soon as their port
    /// does, so `None` is an expected answer.
    pub fn session(&self, id: &SessionId) -> Option<DeviceSession> {
        lock(&self.registry).sessions.get(id).cloned()
    }

    /// The latest record of a live session.
    pub fn last_record(&self, id: &SessionId) -> Option<Record> {
        self.session(id).and_then(|s| s.last_record())
    }

    /// All live sessions, ordered by id.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        let mut sessions: Vec<_> = lock(&self.registry).sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Stops the watcher and every session, then waits for all their threads.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let sessions: Vec<DeviceSession> = {
            let mut registry = lock(&self.registry);
            let mut sessions: Vec<_> = registry.sessions.drain().map(|(_, s)| s).collect();
            sessions.append(&mut registry.retired);
            sessions
        };
        for session in &sessions {
            session.stop();
        }
        for session in &sessions {
            session.join();
        }
        info!("Device manager stopped");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn watch_ports(
    mut watcher: PortWatcher<Box<dyn PortEnumerator>>,
    factory: TransportFactory,
    poll_interval: Duration,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    events: Sender<Event>,
) {
    while running.load(Ordering::SeqCst) {
        let next_poll = Instant::now() + poll_interval;
        let changes = watcher.poll();

        if !changes.appeared.is_empty() {
            let mut registry = lock(&registry);
            for port in changes.appeared {
                info!(
                    "Device connected on {} ({:04x}:{:04x})",
                    port.path, port.vid, port.pid
                );
                let transport = factory(&port);
                let session = DeviceSession::spawn(port, transport, events.clone());
                registry
                    .sessions
                    .insert(session.id().clone(), session.clone());
                registry.new_devices.push(session);
            }
            drop(registry);
            if events.send(Event::DevicesConnected).is_err() {
                break;
            }
        }

        if !changes.disappeared.is_empty() {
            let mut registry = lock(&registry);
            for port in changes.disappeared {
                if let Some(session) = registry.remove_port(&port) {
                    info!("Device removed from {}", port.path);
                    session.stop();
                    registry.removed_devices.push(session.clone());
                    registry.retired.push(session);
                }
            }
            drop(registry);
            if events.send(Event::DevicesRemoved).is_err() {
                break;
            }
        }

        let stopped = lock(&registry).remove_stopped();
        if !stopped.is_empty() {
            for session in &stopped {
                info!("{}: session ended, port will be retried", session.id());
                watcher.forget(&session.port().path);
            }
            if events.send(Event::DevicesRemoved).is_err() {
                break;
            }
        }

        lock(&registry).retired.retain(|s| {
            if s.is_finished() {
                s.join();
                false
            } else {
                true
            }
        });

        while running.load(Ordering::SeqCst) && Instant::now() < next_poll {
            thread::sleep(STOP_CHECK.min(next_poll.saturating_duration_since(Instant::now())));
        }
    }
}
