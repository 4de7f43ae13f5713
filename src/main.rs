//! Monitor storage device health via SMART and alert on failure predictions

use clap::Parser as _;

mod ata;
mod cl;
mod config;
mod daemon;
mod device;
mod monitor;
mod notify;
mod os;
mod schedule;
mod scsi;
mod state;
#[cfg(test)]
mod tests;
mod unaligned;

fn main() -> std::process::ExitCode {
    // parse cl args; the spec'd exit code for a bad command line differs
    // from clap's default
    let args = match cl::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() {
                daemon::exit_code::BAD_CMDLINE
            } else {
                // --help / --version
                daemon::exit_code::OK
            };
            let _ = e.print();
            return std::process::ExitCode::from(code);
        }
    };

    // init logger
    let level = if args.debug {
        log::Level::Debug.max(args.verbosity)
    } else {
        args.verbosity
    };
    if simple_logger::init_with_level(level).is_err() {
        return std::process::ExitCode::from(daemon::exit_code::BAD_CMDLINE);
    }

    if args.showdirectives {
        println!("{}", config::DIRECTIVE_HELP);
        return std::process::ExitCode::from(daemon::exit_code::OK);
    }
    if *args.interval < cl::MIN_INTERVAL {
        log::error!(
            "interval {} below the minimum of {}s",
            args.interval,
            cl::MIN_INTERVAL.as_secs()
        );
        return std::process::ExitCode::from(daemon::exit_code::BAD_CMDLINE);
    }

    let opts = daemon::Options {
        config_path: args.configfile.clone(),
        interval: *args.interval,
        quit: args.quit,
        pidfile: args.pidfile.clone(),
        state_prefix: args.state_prefix.clone(),
        ctx: args.context(),
    };
    std::process::ExitCode::from(daemon::run(&opts))
}
