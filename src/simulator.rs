//! Fake boards for running without hardware.
//!
//! [`SimulatedPorts`] pretends a number of allow-listed boards are plugged
//! in, and [`SimulatedTransport`] plays the part of one of them: it first
//! reports where the four anchors are, then streams the position of a tag
//! walking in a circle, with some noise and the odd line of garbage.

use crate::allow_list::AllowList;
use crate::hardware_message_decoder::{DecodeError, MessageType, Record, Value};
use crate::port_watcher::{PortDescriptor, PortEnumerator};
use crate::transport::{OpenError, Transport};

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{f32::consts::PI, io, time::Duration};

const ANCHORS: [[f32; 3]; 4] = [[0.0, 0.0, 2.5], [5.0, 0.0, 2.5], [5.0, 4.0, 2.5], [0.0, 4.0, 2.5]];
const CENTER: [f32; 3] = [2.5, 2.0, 1.0];
const STEPS_PER_LAP: u64 = 200;
const GARBAGE_EVERY: u64 = 37;

/// Pretends `count` boards are plugged in, all with the first allow-listed
/// ids, on the paths `sim0`, `sim1`, ...
#[derive(Debug, Clone)]
pub struct SimulatedPorts {
    ports: Vec<PortDescriptor>,
}

impl SimulatedPorts {
    /// `count` fake boards matching `allow_list`.
    pub fn new(allow_list: &AllowList, count: usize) -> Self {
        let (vid, pid) = allow_list
            .iter()
            .next()
            .map_or((0, 0), |pair| (pair.vid, pair.pid));
        let ports = (0..count)
            .map(|i| PortDescriptor::new(format!("sim{}", i), vid, pid))
            .collect();
        Self { ports }
    }
}

impl PortEnumerator for SimulatedPorts {
    fn ports(&mut self) -> Vec<PortDescriptor> {
        self.ports.clone()
    }
}

/// A [`Transport`] that makes up lines instead of reading them.
pub struct SimulatedTransport {
    tag_id: u64,
    period: Duration,
    noise: f32,
    radius: f32,
    step: u64,
    open: bool,
    rng: StdRng,
}

impl SimulatedTransport {
    /// Start building a simulated board.
    pub fn builder() -> SimulatedTransportBuilder {
        SimulatedTransportBuilder::default()
    }

    fn position(&mut self) -> [f32; 3] {
        let angle = (self.step % STEPS_PER_LAP) as f32 / STEPS_PER_LAP as f32 * 2.0 * PI;
        let mut jitter = || {
            if self.noise > 0.0 {
                self.rng.gen_range(-self.noise..self.noise)
            } else {
                0.0
            }
        };
        [
            CENTER[0] + self.radius * angle.cos() + jitter(),
            CENTER[1] + self.radius * angle.sin() + jitter(),
            CENTER[2] + jitter(),
        ]
    }

    fn next_record(&mut self) -> Result<Record, DecodeError> {
        let mut values = vec![Value::Unsigned(self.tag_id)];
        let msg_type = if self.step == 1 {
            values.extend(ANCHORS.iter().flatten().map(|&c| Value::Float(c)));
            MessageType::Apr
        } else if self.step % 2 == 0 {
            values.extend(self.position().map(Value::Float));
            MessageType::Tpr
        } else {
            let heading = (self.step % STEPS_PER_LAP) as f32 / STEPS_PER_LAP as f32 * 2.0 * PI;
            values.extend(self.position().map(Value::Float));
            values.extend([0.0, 0.0, heading + PI / 2.0].map(Value::Float));
            MessageType::Kmf
        };
        values.insert(0, Value::Str(msg_type.tag().to_owned()));

        Record::new(msg_type, values)
    }
}

impl Transport for SimulatedTransport {
    fn open(&mut self) -> Result<(), OpenError> {
        self.open = true;
        self.step = 0;
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not open"));
        }

        spin_sleep::sleep(self.period);
        self.step += 1;

        let line = if self.step % GARBAGE_EVERY == 0 {
            "dbg the quick brown fox".to_owned()
        } else {
            self.next_record()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                .encode()
        };
        Ok(format!("{}\r\n", line).into_bytes())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Configures a [`SimulatedTransport`].
#[derive(Debug, Clone)]
pub struct SimulatedTransportBuilder {
    tag_id: u64,
    period: Duration,
    noise: f32,
    radius: f32,
    seed: Option<u64>,
}

impl Default for SimulatedTransportBuilder {
    fn default() -> Self {
        Self {
            tag_id: 0,
            period: Duration::from_millis(100),
            noise: 0.02,
            radius: 1.5,
            seed: None,
        }
    }
}

impl SimulatedTransportBuilder {
    /// Id reported by the fake tag.
    pub fn tag_id(mut self, tag_id: u64) -> Self {
        self.tag_id = tag_id;
        self
    }

    /// Time between two lines.
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Maximum position error, in meters.
    pub fn noise(mut self, noise: f32) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Radius of the circle the tag walks on, in meters.
    pub fn radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    /// Makes the noise reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the transport, closed.
    pub fn build(self) -> SimulatedTransport {
        SimulatedTransport {
            tag_id: self.tag_id,
            period: self.period,
            noise: self.noise,
            radius: self.radius,
            step: 0,
            open: false,
            rng: match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allow_list::VidPid;
    use crate::hardware_message_decoder::decode;

    fn quick() -> SimulatedTransport {
        SimulatedTransport::builder()
            .tag_id(7)
            .period(Duration::ZERO)
            .noise(0.0)
            .seed(1)
            .build()
    }

    #[test]
    fn closed_transport_does_not_read() {
        let mut transport = quick();
        assert!(transport.read_line().is_err());
    }

    #[test]
    fn anchors_come_first() {
        let mut transport = quick();
        transport.open().unwrap();

        let record = decode(&transport.read_line().unwrap()).unwrap();
        assert_eq!(record.msg_type(), MessageType::Apr);
        assert_eq!(record.tag_id(), Some(7));
        assert_eq!(record.anchors(), Some(ANCHORS));
    }

    #[test]
    fn stream_decodes() {
        let mut transport = quick();
        transport.open().unwrap();

        let mut garbage = 0;
        for _ in 0..(2 * GARBAGE_EVERY) {
            match decode(&transport.read_line().unwrap()) {
                Ok(record) => {
                    if let Some([x, y, z]) = record.position() {
                        let r = ((x - CENTER[0]).powi(2) + (y - CENTER[1]).powi(2)).sqrt();
                        assert!((r - 1.5).abs() < 1e-4);
                        assert_eq!(z, CENTER[2]);
                    }
                }
                Err(DecodeError::UnknownMessageType(_)) => garbage += 1,
                Err(e) => panic!("simulator wrote a bad line: {}", e),
            }
        }
        assert_eq!(garbage, 2);
    }

    #[test]
    fn reopen_starts_over() {
        let mut transport = quick();
        transport.open().unwrap();
        transport.read_line().unwrap();
        transport.close();
        transport.open().unwrap();

        let record = decode(&transport.read_line().unwrap()).unwrap();
        assert_eq!(record.msg_type(), MessageType::Apr);
    }

    #[test]
    fn simulated_ports_use_the_allow_list() {
        let list = AllowList::new(vec![VidPid {
            vid: 0x10c4,
            pid: 0xea60,
        }])
        .unwrap();
        let mut ports = SimulatedPorts::new(&list, 3);

        let ports = ports.ports();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[2].path, "sim2");
        assert!(ports.iter().all(|p| list.contains(p.vid, p.pid)));
    }
}
