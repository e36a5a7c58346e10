//! Sandbox entry helper.
//!
//! Spawned by the job supervisor with a fresh process group for every job;
//! not meant to be invoked by hand.

use std::env;
use std::path::PathBuf;
use std::process;

use runnerlib::sandbox;

fn main() {
    let mut args = env::args_os().skip(1);
    let (Some(new_root), Some(profile), Some(command)) = (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: {} <new-root> <profile> <command>", sandbox::SANDBOX_BIN);
        process::exit(2);
    };
    let profile = profile.to_string_lossy().into_owned();
    let command = command.to_string_lossy().into_owned();
    match sandbox::run(&PathBuf::from(new_root), &profile, &command) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{}: {err}", sandbox::SANDBOX_BIN);
            process::exit(1);
        }
    }
}
