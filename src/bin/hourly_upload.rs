use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use aria_batch::run::{run, RunOptions};
use aria_batch::stage::ProcessRunner;
use aria_batch::time_window::{parse_date, Hour, TimeWindow};
use aria_batch::upload::FtpConnector;
use clap::Parser;
use jiff::{civil::Date, Zoned};
use log::{debug, error, Level, LevelFilter};

#[derive(Parser, Debug)]
#[command(version, about = "Download, process and upload the hourly air quality file", long_about = None)]
struct Args {
    /// Location of the wrapper configuration file
    ini_file: PathBuf,

    /// Increase output verbosity
    #[arg(short, long)]
    verbose: bool,

    /// Starting day YYYY/MM/DD. Default: yesterday
    #[arg(short, long, value_parser = parse_date)]
    start: Option<Date>,

    /// Ending day YYYY/MM/DD. Default: today
    #[arg(short, long, value_parser = parse_date)]
    end: Option<Date>,

    /// Hour to be processed/transmitted, 1 to 24. Default: current hour + 1
    #[arg(short = 'H', long)]
    hour: Option<Hour>,

    /// Run the processing chain only, without the FTP transmission
    #[arg(long)]
    skip_upload: bool,

    /// Environment name, loads `.env/<env>.env` for the FTP credentials
    #[arg(long)]
    env: Option<String>,
}

/// Run this job every hour, a few minutes after the stations report.
fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let tag = match record.level() {
                Level::Error => 'E',
                Level::Warn => 'W',
                Level::Info => 'I',
                Level::Debug => 'D',
                Level::Trace => 'T',
            };
            writeln!(buf, "|{}| {}", tag, record.args())
        })
        .init();
    debug!("Log level: DEBUG");

    if let Some(env) = &args.env {
        let path = format!(".env/{}.env", env);
        if let Err(e) = dotenvy::from_path(Path::new(&path)) {
            error!("Cannot load environment file {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    }

    let window = match TimeWindow::resolve(args.start, args.end, args.hour, &Zoned::now()) {
        Ok(w) => w,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let options = RunOptions {
        ini_file: args.ini_file,
        window,
        skip_upload: args.skip_upload,
    };

    match run(&options, &mut ProcessRunner, &mut FtpConnector::default()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
