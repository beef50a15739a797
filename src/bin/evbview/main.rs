//! Headless runner: prints every decoded record and, with `--record`,
//! writes them to CSV files.
//!
//! ```text
//! cargo run --bin evbview -- --config config.ini --record --log-dir logs
//! RUST_LOG=debug cargo run --bin evbview -- --simulate 2
//! ```

use clap::Parser;
use evb1000::{
    allow_list::AllowList,
    args::ViewerArgs,
    csv_logger::SessionLoggers,
    device_manager::Event,
};
use log::{info, warn};
use std::process;

fn main() {
    env_logger::init();
    let args = ViewerArgs::parse();

    let allow_list = match AllowList::load(&args.config) {
        Ok(allow_list) => allow_list,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    info!(
        "Looking for {}",
        allow_list
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (mut manager, events) = args.start_manager(allow_list);
    let mut loggers = SessionLoggers::new(&args.log_dir);

    for event in events.iter() {
        match event {
            Event::DevicesConnected => {
                for session in manager.take_new_devices() {
                    println!("connected {}", session.id());
                    session.set_logging(args.record);
                }
            }
            Event::DevicesRemoved => {
                for session in manager.take_removed_devices() {
                    println!("removed {}", session.id());
                    loggers.forget(&session);
                }
            }
            Event::NewData(id) => {
                let Some(session) = manager.session(&id) else {
                    continue;
                };
                if let Some(record) = session.last_record() {
                    println!("{} {}", id, record);
                }
                loggers.log(&session);
            }
        }
    }

    warn!("Device manager hung up");
    manager.stop();
}
