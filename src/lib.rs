//! Host-side software for the EVB1000 ultra-wideband positioning kit.
//!
//! EVB1000 boards, configured either as tags or as anchors, show up as
//! USB-serial ports and stream their positioning data as lines of hex text.
//! This crate finds the boards as they are plugged in and out, keeps one
//! reading thread per board, and decodes every line into a [`Record`].
//!
//! The pieces, from the bottom up:
//!
//! - [`allow_list`] loads the USB ids that identify EVB1000 boards.
//! - [`port_watcher`] diffs the serial ports present on every poll.
//! - [`hardware_message_decoder`] turns a line into a [`Record`].
//! - [`transport`] and [`simulator`] provide the lines, from a real port or
//!   from thin air.
//! - [`session`] runs the read loop of one board.
//! - [`device_manager`] ties all of that together on background threads.
//! - [`csv_logger`] writes records to disk, [`gui`] shows them in a terminal.
//!
//! [`Record`]: hardware_message_decoder::Record

#![warn(missing_docs)]
pub mod allow_list;
pub mod args;
pub mod csv_logger;
pub mod device_manager;
pub mod gui;
pub mod hardware_message_decoder;
pub mod port_watcher;
pub mod session;
pub mod simulator;
pub mod transport;
