use std::io;

use log::{error, info};
use thiserror::Error;

use crate::config::{ArtifactParams, ExecutableSet, PreparationParams};
use crate::stage::{OutputSink, Stage, StageLog, StageRunner};
use crate::time_window::TimeWindow;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(
        "Something wrong with the {stage} {executable}{}",
        .province.as_ref().map(|p| format!(" (province {p})")).unwrap_or_default()
    )]
    StageFailed {
        stage: Stage,
        executable: String,
        province: Option<String>,
        exit_code: Option<i32>,
    },
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        stage: Stage,
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Where the pipeline is.  The index is the position in the province list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Downloading,
    Organizing(usize),
    Aggregating(usize),
    Converting,
    Done,
    /// The stage that failed, or whose log file could not be opened.
    Failed(Stage),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

/// Log files of the stages run after the download.
struct StageLogs {
    /// Organizer and aggregator logs, dropped when the province phase ends.
    province: Option<(OutputSink, OutputSink)>,
    convert: OutputSink,
}

impl StageLogs {
    fn open(preparation: &PreparationParams) -> Result<StageLogs, PipelineError> {
        let open = |stage: Stage| {
            let path = preparation.log_file(stage.log_name());
            StageLog::create(&path)
                .map(OutputSink::Log)
                .map_err(|source| PipelineError::LogFile {
                    stage,
                    path,
                    source,
                })
        };
        Ok(StageLogs {
            province: Some((open(Stage::Organize)?, open(Stage::Aggregate)?)),
            convert: open(Stage::Convert)?,
        })
    }
}

/// Download, organize and aggregate each province, then convert.  The first
/// failing stage ends the run.
pub struct Pipeline<'a> {
    executables: &'a ExecutableSet,
    preparation: &'a PreparationParams,
    artifact: &'a ArtifactParams,
    window: &'a TimeWindow,
    artifact_path: String,
    state: PipelineState,
    logs: Option<StageLogs>,
    failure: Option<PipelineError>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        executables: &'a ExecutableSet,
        preparation: &'a PreparationParams,
        artifact: &'a ArtifactParams,
        window: &'a TimeWindow,
    ) -> Pipeline<'a> {
        Pipeline {
            executables,
            preparation,
            artifact,
            window,
            artifact_path: artifact.artifact_path(window),
            state: PipelineState::Idle,
            logs: None,
            failure: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn artifact_path(&self) -> &str {
        &self.artifact_path
    }

    /// Drive the state machine to the end.  Returns the path of the
    /// generated artifact.
    pub fn run<R: StageRunner>(mut self, runner: &mut R) -> Result<String, PipelineError> {
        while !self.state.is_terminal() {
            self.step(runner);
        }
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self.artifact_path),
        }
    }

    /// Perform one transition.
    pub fn step<R: StageRunner>(&mut self, runner: &mut R) {
        let preparation: &'a PreparationParams = self.preparation;
        let provinces = &preparation.provinces;
        self.state = match self.state {
            PipelineState::Idle => PipelineState::Downloading,
            PipelineState::Downloading => {
                info!("Executing {}", self.executables.downloader);
                let ok = self.invoke(runner, Stage::Download, None);
                if ok {
                    info!("Execution of {}, DONE", self.executables.downloader);
                    self.open_logs()
                } else {
                    PipelineState::Failed(Stage::Download)
                }
            }
            PipelineState::Organizing(i) => {
                info!("Parsing province: {}", provinces[i]);
                if self.invoke(runner, Stage::Organize, Some(i)) {
                    PipelineState::Aggregating(i)
                } else {
                    PipelineState::Failed(Stage::Organize)
                }
            }
            PipelineState::Aggregating(i) => {
                if !self.invoke(runner, Stage::Aggregate, Some(i)) {
                    PipelineState::Failed(Stage::Aggregate)
                } else if i + 1 < provinces.len() {
                    PipelineState::Organizing(i + 1)
                } else {
                    PipelineState::Converting
                }
            }
            PipelineState::Converting => {
                if self.invoke(runner, Stage::Convert, None) {
                    PipelineState::Done
                } else {
                    PipelineState::Failed(Stage::Convert)
                }
            }
            s @ (PipelineState::Done | PipelineState::Failed(_)) => s,
        };
        self.release_logs();
    }

    fn open_logs(&mut self) -> PipelineState {
        match StageLogs::open(self.preparation) {
            Ok(logs) => {
                self.logs = Some(logs);
                if self.preparation.provinces.is_empty() {
                    PipelineState::Converting
                } else {
                    PipelineState::Organizing(0)
                }
            }
            Err(e) => {
                error!("{}", e);
                let stage = match &e {
                    PipelineError::LogFile { stage, .. } => *stage,
                    PipelineError::StageFailed { stage, .. } => *stage,
                };
                self.failure = Some(e);
                PipelineState::Failed(stage)
            }
        }
    }

    /// Close the organizer and aggregator logs once the province phase is
    /// over, and every log once the run has ended.
    fn release_logs(&mut self) {
        match self.state {
            PipelineState::Organizing(_) | PipelineState::Aggregating(_) => {}
            PipelineState::Done | PipelineState::Failed(_) => self.logs = None,
            _ => {
                if let Some(logs) = self.logs.as_mut() {
                    logs.province = None;
                }
            }
        }
    }

    fn invoke<R: StageRunner>(
        &mut self,
        runner: &mut R,
        stage: Stage,
        province: Option<usize>,
    ) -> bool {
        let preparation: &'a PreparationParams = self.preparation;
        let province = province.map(|i| preparation.provinces[i].as_str());
        let executable = self.executable(stage);
        let args = self.args(stage, province);
        if stage != Stage::Download {
            info!("Executing: {}", executable);
        }
        let inherit = OutputSink::Inherit;
        let sink = match (stage, self.logs.as_ref()) {
            (Stage::Organize, Some(StageLogs { province: Some((org, _)), .. })) => org,
            (Stage::Aggregate, Some(StageLogs { province: Some((_, agg)), .. })) => agg,
            (Stage::Convert, Some(logs)) => &logs.convert,
            _ => &inherit,
        };
        let result = runner.run(executable, &args, sink);
        if !result.succeeded {
            let e = PipelineError::StageFailed {
                stage,
                executable: executable.to_string(),
                province: province.map(str::to_string),
                exit_code: result.exit_code,
            };
            error!("{}", e);
            self.failure = Some(e);
        }
        result.succeeded
    }

    fn executable(&self, stage: Stage) -> &'a str {
        let exe = self.executables;
        match stage {
            Stage::Download => &exe.downloader,
            Stage::Organize => &exe.organizer,
            Stage::Aggregate => &exe.aggregator,
            Stage::Convert => &exe.converter,
        }
    }

    /// Positional arguments of each tool.
    pub fn args(&self, stage: Stage, province: Option<&str>) -> Vec<String> {
        let prep = self.preparation;
        let start = self.window.start_str();
        let end = self.window.end_str();
        let province = province.unwrap_or_default().to_string();
        match stage {
            Stage::Download => vec![
                "-t".to_string(),
                "i".to_string(),
                "-s".to_string(),
                start,
                "-e".to_string(),
                end,
                "-o".to_string(),
                prep.target_datafile(),
            ],
            Stage::Organize => vec![
                prep.config_path.clone(),
                start,
                end,
                prep.delta_time.clone(),
                province,
            ],
            Stage::Aggregate => vec![prep.config_path.clone(), start, end, province],
            Stage::Convert => vec![
                self.window.time_marker(),
                self.artifact.sampling_points_file.clone(),
                self.artifact.pollutant_file.clone(),
                self.artifact.station_file.clone(),
                prep.output_dir.clone(),
                self.artifact_path.clone(),
            ],
        }
    }
}
