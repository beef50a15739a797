use clap::Parser;
use evb1000::{
    allow_list::AllowList, args::ViewerArgs, csv_logger::SessionLoggers, gui::session_monitor,
};
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

    let (mut manager, events) = args.start_manager(allow_list);
    let mut loggers = SessionLoggers::new(&args.log_dir);

    let res = session_monitor(&manager, &events, &mut loggers, args.record);
    manager.stop();

    if let Err(err) = res {
        eprintln!("{}", err);
        process::exit(1);
    }
}
