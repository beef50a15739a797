// Commandline argument parser using clap, shared by both binaries

use crate::allow_list::AllowList;
use crate::device_manager::{DeviceManager, Event};
use crate::port_watcher::PortDescriptor;
use crate::simulator::{SimulatedPorts, SimulatedTransport};
use crate::transport::{Transport, DEFAULT_BAUD_RATE};

use clap::Parser;
use std::{path::PathBuf, sync::mpsc::Receiver, time::Duration};

/// Options for talking to EVB1000 boards.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ViewerArgs {
    /// File listing the USB VID/PID pairs of the boards to connect to
    #[arg(short, long, default_value = "config.ini")]
    pub config: PathBuf,

    /// How often to look for plugged and unplugged boards, in milliseconds
    #[arg(short, long = "poll-ms", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Baud rate of the serial ports
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Directory the CSV logs are written to
    #[arg(short = 'o', long = "log-dir", default_value = ".")]
    pub log_dir: PathBuf,

    /// Start logging every new board to CSV right away
    #[arg(short, long)]
    pub record: bool,

    /// Don't touch any hardware, pretend this many boards are plugged in
    #[arg(short, long, value_name = "BOARDS")]
    pub simulate: Option<usize>,
}

impl ViewerArgs {
    /// Time between two port polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Starts a [`DeviceManager`] configured from these arguments.
    pub fn start_manager(&self, allow_list: AllowList) -> (DeviceManager, Receiver<Event>) {
        let builder = match self.simulate {
            Some(boards) => {
                let ports = SimulatedPorts::new(&allow_list, boards);
                DeviceManager::builder(allow_list)
                    .enumerator(ports)
                    .transport_factory(|port: &PortDescriptor| -> Box<dyn Transport> {
                        // sim0 is tag 0, sim1 is tag 1, ...
                        let tag_id = port.path.trim_start_matches("sim").parse().unwrap_or(0);
                        Box::new(SimulatedTransport::builder().tag_id(tag_id).build())
                    })
            }
            None => DeviceManager::builder(allow_list).baud_rate(self.baud),
        };

        builder.poll_interval(self.poll_interval()).start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allow_list::VidPid;

    #[test]
    fn defaults() {
        let args = ViewerArgs::parse_from(["evbview"]);
        assert_eq!(args.config, PathBuf::from("config.ini"));
        assert_eq!(args.poll_interval(), Duration::from_secs(1));
        assert_eq!(args.baud, 115200);
        assert!(!args.record);
        assert_eq!(args.simulate, None);
    }

    #[test]
    fn simulated_boards_connect() {
        let args = ViewerArgs::parse_from(["evbview", "--simulate", "2", "--poll-ms", "10"]);
        let allow_list = AllowList::new(vec![VidPid {
            vid: 0x0403,
            pid: 0x6001,
        }])
        .unwrap();

        let (mut manager, events) = args.start_manager(allow_list);
        loop {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(Event::DevicesConnected) => break,
                Ok(_) => continue,
                Err(e) => panic!("no boards connected: {:?}", e),
            }
        }
        let paths: Vec<String> = manager
            .take_new_devices()
            .iter()
            .map(|s| s.port().path.clone())
            .collect();
        assert_eq!(paths, vec!["sim0", "sim1"]);

        manager.stop();
    }
}
