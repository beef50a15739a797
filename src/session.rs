//! One connected board and the thread reading from it.
//!
//! A session starts out [`Running`](SessionState::Running) and ends up
//! [`Stopped`](SessionState::Stopped), never the other way around. The read
//! loop checks the state once per line, so stopping is cooperative: a
//! session stuck in a read only notices after the read returns.
//!
//! At most one [`Event::NewData`] per session is waiting in the channel at
//! any time. Reading [`DeviceSession::last_record`] re-arms it.

use crate::device_manager::Event;
use crate::hardware_message_decoder::{decode, Record};
use crate::port_watcher::PortDescriptor;
use crate::transport::{OpenError, Transport};

use log::{debug, info, trace, warn};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::Sender,
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const OPEN_RETRY_PAUSE: Duration = Duration::from_millis(100);
const READ_ERROR_PAUSE: Duration = Duration::from_millis(10);
// Oldest records are dropped past this when the logger falls behind.
const MAX_UNLOGGED: usize = 1024;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Identifies a session. A board that is unplugged and plugged back in gets
/// a new id even if it shows up on the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    path: String,
    serial: u64,
}

impl SessionId {
    fn next(port: &PortDescriptor) -> Self {
        Self {
            path: port.path.clone(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Path of the port the session reads from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path, self.serial)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading lines
    Running,
    /// Done for good, the transport is closed or about to be
    Stopped,
}

// A panicking reader must not take the accessors down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Unlogged {
    records: VecDeque<Record>,
    dropped: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    last_record: Mutex<Option<Record>>,
    // set while a NewData event is waiting to be read
    notified: AtomicBool,
    logging: Mutex<bool>,
    unlogged: Mutex<Unlogged>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A handle on a running (or stopped) session. Clones share the session.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    id: SessionId,
    port: PortDescriptor,
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// Creates a running session for `port` and starts its read loop on a
    /// new thread. Every decoded record is announced on `events`.
    pub fn spawn(
        port: PortDescriptor,
        transport: Box<dyn Transport>,
        events: Sender<Event>,
    ) -> Self {
        let session = Self {
            id: SessionId::next(&port),
            port,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Running),
                last_record: Mutex::new(None),
                notified: AtomicBool::new(false),
                logging: Mutex::new(false),
                unlogged: Mutex::new(Unlogged::default()),
                handle: Mutex::new(None),
            }),
        };

        let th_session = session.clone();
        let handle = thread::spawn(move || read_loop(th_session, transport, events));
        *lock(&session.shared.handle) = Some(handle);

        session
    }

    /// The id of this session.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The port this session reads from.
    pub fn port(&self) -> &PortDescriptor {
        &self.port
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Shorthand for `state() == Running`.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Asks the read loop to stop. Returns true if this call did the
    /// `Running -> Stopped` transition.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.shared.state);
        let was_running = *state == SessionState::Running;
        *state = SessionState::Stopped;
        was_running
    }

    /// A copy of the most recent record, if any arrived yet. Only the latest
    /// record is kept, older ones are gone.
    ///
    /// Calling this re-arms the notification: the next decoded record sends
    /// a fresh [`Event::NewData`].
    pub fn last_record(&self) -> Option<Record> {
        self.shared.notified.store(false, Ordering::SeqCst);
        lock(&self.shared.last_record).clone()
    }

    // Returns true if nobody was notified since the last read.
    fn publish(&self, record: Record) -> bool {
        if self.logging() {
            let mut unlogged = lock(&self.shared.unlogged);
            if unlogged.records.len() == MAX_UNLOGGED {
                unlogged.records.pop_front();
                unlogged.dropped += 1;
            }
            unlogged.records.push_back(record.clone());
        }
        *lock(&self.shared.last_record) = Some(record);
        !self.shared.notified.swap(true, Ordering::SeqCst)
    }

    /// Every record decoded while logging was on that has not been taken
    /// yet, oldest first.
    pub fn take_unlogged(&self) -> Vec<Record> {
        let mut unlogged = lock(&self.shared.unlogged);
        if unlogged.dropped > 0 {
            warn!(
                "{}: logger fell behind, {} records were dropped",
                self.id, unlogged.dropped
            );
            unlogged.dropped = 0;
        }
        unlogged.records.drain(..).collect()
    }

    /// Should records from this session be written to disk?
    pub fn logging(&self) -> bool {
        *lock(&self.shared.logging)
    }

    /// Turns logging on or off. Turning it off discards the records that
    /// were not taken yet.
    pub fn set_logging(&self, enabled: bool) {
        *lock(&self.shared.logging) = enabled;
        if !enabled {
            *lock(&self.shared.unlogged) = Unlogged::default();
        }
    }

    /// Has the read loop exited?
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.handle)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the read loop to exit. Call [`stop`](Self::stop) first or
    /// this waits until the transport fails to open.
    pub fn join(&self) {
        let handle = lock(&self.shared.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{}: read loop panicked", self.id);
            }
        }
    }
}

fn connect(session: &DeviceSession, transport: &mut dyn Transport) -> bool {
    while session.is_running() {
        match transport.open() {
            Ok(()) => return true,
            Err(OpenError::NotReady(e)) => {
                trace!("{}: not ready yet ({})", session.id, e);
                thread::sleep(OPEN_RETRY_PAUSE);
            }
            Err(e @ OpenError::Unrecoverable(_)) => {
                warn!("{}: {}", session.id, e);
                return false;
            }
        }
    }
    false
}

fn read_loop(session: DeviceSession, mut transport: Box<dyn Transport>, events: Sender<Event>) {
    info!("{}: session started", session.id);

    if connect(&session, transport.as_mut()) {
        debug!("{}: port open", session.id);
        while session.is_running() {
            let line = match transport.read_line() {
                Ok(line) => line,
                Err(e) => {
                    trace!("{}: read failed: {}", session.id, e);
                    thread::sleep(READ_ERROR_PAUSE);
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match decode(&line) {
                Ok(record) => {
                    debug!("{}: {}", session.id, record);
                    // nobody listening is fine, the record stays readable
                    if session.publish(record) {
                        let _ = events.send(Event::NewData(session.id.clone()));
                    }
                }
                Err(e) => trace!("{}: dropped line: {}", session.id, e),
            }
        }
    }

    session.stop();
    transport.close();
    info!("{}: session stopped", session.id);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        io,
        sync::{
            atomic::AtomicUsize,
            mpsc::{channel, Receiver},
        },
        time::Instant,
    };

    /// Counts calls so tests can check how the session drove it.
    #[derive(Debug, Default)]
    pub(crate) struct Calls {
        pub opens: AtomicUsize,
        pub closes: AtomicUsize,
    }

    /// Replays canned lines, then a tpr line every few milliseconds if
    /// `repeat` is set, otherwise nothing.
    pub(crate) struct FakeTransport {
        pub lines: VecDeque<Vec<u8>>,
        pub not_ready: usize,
        pub broken: bool,
        pub repeat: bool,
        pub calls: Arc<Calls>,
    }

    impl FakeTransport {
        pub fn new(lines: &[&[u8]]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_vec()).collect(),
                not_ready: 0,
                broken: false,
                repeat: false,
                calls: Arc::new(Calls::default()),
            }
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self) -> Result<(), OpenError> {
            self.calls.opens.fetch_add(1, Ordering::SeqCst);
            let err = || io::Error::new(io::ErrorKind::Other, "fake");
            if self.broken {
                return Err(OpenError::Unrecoverable(err()));
            }
            if self.not_ready > 0 {
                self.not_ready -= 1;
                return Err(OpenError::NotReady(err()));
            }
            Ok(())
        }

        fn read_line(&mut self) -> io::Result<Vec<u8>> {
            if let Some(line) = self.lines.pop_front() {
                return Ok(line);
            }
            thread::sleep(Duration::from_millis(5));
            if self.repeat {
                Ok(b"tpr 01 3f800000 40000000 40400000\r\n".to_vec())
            } else {
                Ok(Vec::new())
            }
        }

        fn close(&mut self) {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn port() -> PortDescriptor {
        PortDescriptor::new("/dev/ttyUSB0", 0x0403, 0x6001)
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // Looks at the latest record without re-arming the notification.
    fn latest_tag(session: &DeviceSession) -> Option<u64> {
        lock(&session.shared.last_record)
            .as_ref()
            .and_then(Record::tag_id)
    }

    fn next_data(rx: &Receiver<Event>) -> SessionId {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::NewData(id)) => id,
            other => panic!("expected new data, got {:?}", other),
        }
    }

    #[test]
    fn bad_lines_are_skipped() {
        let transport = FakeTransport::new(&[
            b"xyz 01 00000000\r\n",
            b"tpr 01 3f80000 40000000 40400000\r\n",
            b"tpr 01\r\n",
            b"\xff\xff\xff\r\n",
            b"tpr 02 412570a4 412570a4 412570a4\r\n",
        ]);
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        // the only notification is for the single good line
        assert_eq!(&next_data(&rx), session.id());
        let record = session.last_record().unwrap();
        assert_eq!(record.tag_id(), Some(2));
        assert_eq!(record.position(), Some([10.34, 10.34, 10.34]));

        session.stop();
        session.join();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn newer_records_replace_older_ones() {
        let transport = FakeTransport::new(&[
            b"tpr 01 3f800000 3f800000 3f800000\r\n",
            b"tpr 02 40000000 40000000 40000000\r\n",
        ]);
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        next_data(&rx);
        assert!(wait_until(|| latest_tag(&session) == Some(2)));
        assert_eq!(session.last_record().unwrap().tag_id(), Some(2));

        session.stop();
        session.join();
    }

    #[test]
    fn one_pending_notification_per_session() {
        let transport = FakeTransport::new(&[
            b"tpr 01 3f800000 3f800000 3f800000\r\n",
            b"tpr 02 40000000 40000000 40000000\r\n",
            b"tpr 03 40400000 40400000 40400000\r\n",
        ]);
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        next_data(&rx);
        assert!(wait_until(|| latest_tag(&session) == Some(3)));
        // three records, nobody read them, one event
        assert!(rx.try_recv().is_err());
        assert_eq!(session.last_record().unwrap().tag_id(), Some(3));

        session.stop();
        session.join();
    }

    #[test]
    fn reading_the_record_rearms_the_notification() {
        let mut transport = FakeTransport::new(&[]);
        transport.repeat = true;
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        next_data(&rx);
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        assert!(session.last_record().is_some());
        assert_eq!(&next_data(&rx), session.id());

        session.stop();
        session.join();
    }

    #[test]
    fn records_are_kept_for_the_logger() {
        let mut transport = FakeTransport::new(&[
            b"tpr 01 3f800000 3f800000 3f800000\r\n",
            b"tpr 02 40000000 40000000 40000000\r\n",
        ]);
        // gives the test time to turn logging on before the first line
        transport.not_ready = 2;
        let (tx, _rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);
        session.set_logging(true);

        assert!(wait_until(|| latest_tag(&session) == Some(2)));
        let tags: Vec<_> = session
            .take_unlogged()
            .iter()
            .map(|r| r.tag_id())
            .collect();
        assert_eq!(tags, vec![Some(1), Some(2)]);
        assert!(session.take_unlogged().is_empty());

        session.stop();
        session.join();
    }

    #[test]
    fn nothing_is_kept_while_logging_is_off() {
        let transport = FakeTransport::new(&[b"tpr 01 3f800000 3f800000 3f800000\r\n"]);
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        next_data(&rx);
        assert!(session.take_unlogged().is_empty());

        session.stop();
        session.join();
    }

    #[test]
    fn stop_is_one_way_and_closes_once() {
        let mut transport = FakeTransport::new(&[]);
        transport.repeat = true;
        let calls = transport.calls.clone();
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);
        next_data(&rx);

        assert_eq!(session.state(), SessionState::Running);
        assert!(session.stop());
        assert!(!session.stop());
        session.join();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.is_finished());
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);

        assert!(!session.stop());
        session.join();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_is_retried_until_ready() {
        let mut transport = FakeTransport::new(&[b"tpr 01 3f800000 3f800000 3f800000\r\n"]);
        transport.not_ready = 3;
        let calls = transport.calls.clone();
        let (tx, rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        next_data(&rx);
        assert_eq!(calls.opens.load(Ordering::SeqCst), 4);

        session.stop();
        session.join();
    }

    #[test]
    fn unrecoverable_open_stops_the_session() {
        let mut transport = FakeTransport::new(&[]);
        transport.broken = true;
        let calls = transport.calls.clone();
        let (tx, _rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        assert!(wait_until(|| session.state() == SessionState::Stopped));
        session.join();
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        assert!(session.last_record().is_none());
    }

    #[test]
    fn stopping_while_not_ready() {
        let mut transport = FakeTransport::new(&[]);
        transport.not_ready = usize::MAX;
        let calls = transport.calls.clone();
        let (tx, _rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(transport), tx);

        assert!(wait_until(|| calls.opens.load(Ordering::SeqCst) > 0));
        session.stop();
        session.join();
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique_per_session() {
        let (tx, _rx) = channel();
        let a = DeviceSession::spawn(port(), Box::new(FakeTransport::new(&[])), tx.clone());
        let b = DeviceSession::spawn(port(), Box::new(FakeTransport::new(&[])), tx);

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().path(), b.id().path());

        for s in [a, b] {
            s.stop();
            s.join();
        }
    }

    #[test]
    fn logging_flag() {
        let (tx, _rx) = channel();
        let session = DeviceSession::spawn(port(), Box::new(FakeTransport::new(&[])), tx);

        assert!(!session.logging());
        session.set_logging(true);
        assert!(session.clone().logging());

        session.stop();
        session.join();
    }
}
