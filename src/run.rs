use std::path::PathBuf;

use jiff::{tz::TimeZone, Zoned};
use log::{error, info};
use thiserror::Error;

use crate::config::{ConfigError, Section, WrapperConfig};
use crate::pipeline::{Pipeline, PipelineError};
use crate::stage::StageRunner;
use crate::time_window::{InputError, TimeWindow};
use crate::upload::{upload, Connector};

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Error in {section} section of INI file: {path}")]
    InvalidSection { section: Section, path: String },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Something wrong with data transmission: {failed} of {total} file(s) not transmitted")]
    Upload { failed: usize, total: usize },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ini_file: PathBuf,
    pub window: TimeWindow,
    /// Run the pipeline only, without the `[ftp]` section and the upload.
    pub skip_upload: bool,
}

/// Load and check the configuration, run every stage, then upload the
/// artifact.  Returns the artifact path.
pub fn run<R, C>(
    options: &RunOptions,
    runner: &mut R,
    connector: &mut C,
) -> Result<String, RunError>
where
    R: StageRunner,
    C: Connector,
{
    let ini_file = options.ini_file.display().to_string();
    let window = &options.window;
    let config = WrapperConfig::load(&options.ini_file, !options.skip_upload)?;

    info!("Wrapper initializing");
    info!("Configuration file: {}", ini_file);
    info!("Time period: {} => {}", window.start_str(), window.end_str());
    info!("Processing time: {}", window.hour);

    let artifact = config.artifact.artifact_path(window);
    info!("Output file: {}", artifact);

    if let Some((section, problems)) = config.problems().into_iter().next() {
        for p in problems {
            error!("{} {}", section, p);
        }
        return Err(RunError::InvalidSection {
            section,
            path: ini_file,
        });
    }

    let pipeline = Pipeline::new(
        &config.executables,
        &config.preparation,
        &config.artifact,
        window,
    );
    let artifact = pipeline.run(runner)?;

    match config.transfer.filter(|_| !options.skip_upload) {
        Some(transfer) => {
            let transfer = transfer.with_env_credentials();
            info!("Starting transmission to: {}", transfer.server_address);
            let files = vec![artifact.clone()];
            let outcome = upload(connector, &transfer, &files);
            if !outcome.overall {
                return Err(RunError::Upload {
                    failed: files.len() - outcome.per_file.iter().filter(|(_, ok)| *ok).count(),
                    total: files.len(),
                });
            }
        }
        None => info!("Upload skipped"),
    }

    info!(
        "Execution terminated without error at {}",
        completion_stamp(&Zoned::now())
    );
    Ok(artifact)
}

/// `now` in UTC, e.g. `2019.01.02 00:05 UTC`.
pub fn completion_stamp(now: &Zoned) -> String {
    now.with_time_zone(TimeZone::UTC)
        .strftime("%Y.%m.%d %H:%M %Z")
        .to_string()
}
