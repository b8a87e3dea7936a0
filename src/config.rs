use std::collections::HashMap;
use std::env;
use std::fmt::{self, Display};
use std::fs::File;
use std::path::Path;

use ini::{Ini, ParseOption};
use log::debug;
use thiserror::Error;

use crate::time_window::TimeWindow;

/// Accepted values for the data organizer aggregation step, in hours.
pub const DELTA_TIME_VALUES: [&str; 3] = ["3", "6", "24"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("There is a syntax error in your INI file {path}: {message}")]
    Syntax { path: String, message: String },
    #[error("Error in INI file: no section [{0}]")]
    MissingSection(String),
    #[error("Error in INI file: no option '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },
    #[error("Error in your INI file: no province set")]
    NoProvince,
}

/// The four sections of the wrapper configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Executables,
    Preparation,
    Artifact,
    Transfer,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Section::Executables => "main",
            Section::Preparation => "dataorganizer",
            Section::Artifact => "infoaria",
            Section::Transfer => "ftp",
        }
    }

    /// Keys that must be present in the section.
    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            Section::Executables => &["dataorganizer", "mainelab", "infoaria", "db_download"],
            Section::Preparation => &[
                "ini_file",
                "delta_time",
                "provs",
                "do_input_datafile",
                "output_path",
            ],
            Section::Artifact => &[
                "sampling_point",
                "pollutant_file",
                "station_file",
                "output_path",
                "output_file_suffix",
                "output_file_extension",
            ],
            Section::Transfer => &["server", "username", "password", "remote_path"],
        }
    }

    /// Guess the role of an untyped key/value section from the keys it
    /// carries.  Returns `None` when no role's keys are all present.
    pub fn infer(keys: &HashMap<String, String>) -> Option<Section> {
        [
            Section::Executables,
            Section::Preparation,
            Section::Artifact,
            Section::Transfer,
        ]
        .into_iter()
        .find(|s| s.keys().iter().all(|k| keys.contains_key(*k)))
    }
}

impl Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.name())
    }
}

/// Checks of one typed section against the filesystem.
pub trait SectionCheck {
    /// Every failing check, as a readable line.
    fn problems(&self) -> Vec<String>;

    fn is_valid(&self) -> bool {
        self.problems().is_empty()
    }
}

fn is_file(path: &str) -> bool {
    !path.is_empty() && Path::new(path).is_file()
}

fn is_dir(path: &str) -> bool {
    !path.is_empty() && Path::new(path).is_dir()
}

/// Paths of the external tools, section `[main]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSet {
    pub downloader: String,
    pub organizer: String,
    pub aggregator: String,
    pub converter: String,
}

impl SectionCheck for ExecutableSet {
    fn problems(&self) -> Vec<String> {
        [
            ("db_download", &self.downloader),
            ("dataorganizer", &self.organizer),
            ("mainelab", &self.aggregator),
            ("infoaria", &self.converter),
        ]
        .into_iter()
        .filter(|(_, path)| !is_file(path))
        .map(|(key, path)| format!("{key}: executable not found: '{path}'"))
        .collect()
    }
}

/// Data download and organizer parameters, section `[dataorganizer]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparationParams {
    pub config_path: String,
    pub delta_time: String,
    pub provinces: Vec<String>,
    pub input_datafile: String,
    pub output_dir: String,
}

impl PreparationParams {
    /// File the downloader writes and the organizer reads.
    pub fn target_datafile(&self) -> String {
        format!("{}{}", self.output_dir, self.input_datafile)
    }

    /// Log file collecting the output of one stage tool.
    pub fn log_file(&self, name: &str) -> String {
        format!("{}{}.log", self.output_dir, name)
    }
}

impl SectionCheck for PreparationParams {
    fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !is_file(&self.config_path) {
            out.push(format!("ini_file: file not found: '{}'", self.config_path));
        }
        if !is_dir(&self.output_dir) {
            out.push(format!(
                "output_path: directory not found: '{}'",
                self.output_dir
            ));
        }
        if self.input_datafile.is_empty() {
            out.push("do_input_datafile: value is empty".to_string());
        }
        if !DELTA_TIME_VALUES.contains(&self.delta_time.as_str()) {
            out.push(format!(
                "delta_time: '{}' is not one of {:?}",
                self.delta_time, DELTA_TIME_VALUES
            ));
        }
        if self.provinces.is_empty() {
            out.push("provs: no province set".to_string());
        }
        out
    }
}

/// Converter parameters, section `[infoaria]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactParams {
    pub sampling_points_file: String,
    pub pollutant_file: String,
    pub station_file: String,
    pub output_dir: String,
    pub filename_suffix: String,
    pub filename_extension: String,
}

impl ArtifactParams {
    /// Full path of the file produced by the converter for this window.
    pub fn artifact_path(&self, window: &TimeWindow) -> String {
        format!(
            "{}{}{}{}",
            self.output_dir,
            self.filename_suffix,
            window.time_marker(),
            self.filename_extension
        )
    }
}

impl SectionCheck for ArtifactParams {
    fn problems(&self) -> Vec<String> {
        let mut out: Vec<String> = [
            ("sampling_point", &self.sampling_points_file),
            ("pollutant_file", &self.pollutant_file),
            ("station_file", &self.station_file),
        ]
        .into_iter()
        .filter(|(_, path)| !is_file(path))
        .map(|(key, path)| format!("{key}: file not found: '{path}'"))
        .collect();
        if !is_dir(&self.output_dir) {
            out.push(format!(
                "output_path: directory not found: '{}'",
                self.output_dir
            ));
        }
        if self.filename_suffix.is_empty() {
            out.push("output_file_suffix: value is empty".to_string());
        }
        if self.filename_extension.is_empty() {
            out.push("output_file_extension: value is empty".to_string());
        }
        out
    }
}

/// FTP upload parameters, section `[ftp]`.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferParams {
    pub server_address: String,
    pub username: String,
    pub password: String,
    pub remote_directory: String,
}

impl TransferParams {
    /// Fill empty credentials from `FTP_USERNAME` / `FTP_PASSWORD`.
    pub fn with_env_credentials(mut self) -> TransferParams {
        if self.username.is_empty() {
            if let Ok(user) = env::var("FTP_USERNAME") {
                self.username = user;
            }
        }
        if self.password.is_empty() {
            if let Ok(password) = env::var("FTP_PASSWORD") {
                self.password = password;
            }
        }
        self
    }
}

impl SectionCheck for TransferParams {
    fn problems(&self) -> Vec<String> {
        if self.server_address.is_empty() {
            vec!["server: no FTP server address".to_string()]
        } else {
            vec![]
        }
    }
}

// Keep the password out of the logs.
impl fmt::Debug for TransferParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferParams")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field("password", &"***")
            .field("remote_directory", &self.remote_directory)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub executables: ExecutableSet,
    pub preparation: PreparationParams,
    pub artifact: ArtifactParams,
    /// `None` when loaded without the transfer section.
    pub transfer: Option<TransferParams>,
}

impl WrapperConfig {
    /// Load the INI file.  The `[ftp]` section is only required when
    /// `with_transfer` is set.
    pub fn load(path: &Path, with_transfer: bool) -> Result<WrapperConfig, ConfigError> {
        let display = path.display().to_string();
        // surface permission problems before the parser swallows them
        File::open(path).map_err(|source| ConfigError::Unreadable {
            path: display.clone(),
            source,
        })?;
        let ini = Ini::load_from_file_opt(path, parse_option()).map_err(|e| match e {
            ini::Error::Io(source) => ConfigError::Unreadable {
                path: display.clone(),
                source,
            },
            other => ConfigError::Syntax {
                path: display.clone(),
                message: other.to_string(),
            },
        })?;
        debug!("Parsed configuration file {}", display);
        WrapperConfig::from_ini(&ini, with_transfer)
    }

    pub fn from_ini(ini: &Ini, with_transfer: bool) -> Result<WrapperConfig, ConfigError> {
        let main = SectionReader::new(ini, Section::Executables)?;
        let executables = ExecutableSet {
            organizer: main.get("dataorganizer")?,
            aggregator: main.get("mainelab")?,
            converter: main.get("infoaria")?,
            downloader: main.get("db_download")?,
        };

        let prep = SectionReader::new(ini, Section::Preparation)?;
        let preparation = PreparationParams {
            config_path: prep.get("ini_file")?,
            delta_time: prep.get("delta_time")?,
            provinces: parse_provinces(&prep.get("provs")?)?,
            input_datafile: prep.get("do_input_datafile")?,
            output_dir: prep.get("output_path")?,
        };

        let conv = SectionReader::new(ini, Section::Artifact)?;
        let artifact = ArtifactParams {
            sampling_points_file: conv.get("sampling_point")?,
            pollutant_file: conv.get("pollutant_file")?,
            station_file: conv.get("station_file")?,
            output_dir: conv.get("output_path")?,
            filename_suffix: conv.get("output_file_suffix")?,
            filename_extension: conv.get("output_file_extension")?,
        };

        let transfer = match SectionReader::new(ini, Section::Transfer) {
            Ok(ftp) => Some(TransferParams {
                server_address: ftp.get("server")?,
                username: ftp.get("username")?,
                password: ftp.get("password")?,
                remote_directory: ftp.get("remote_path")?,
            }),
            Err(e) if with_transfer => return Err(e),
            Err(_) => None,
        };

        Ok(WrapperConfig {
            executables,
            preparation,
            artifact,
            transfer,
        })
    }

    /// Problems of each section, in file order.  Sections without problems
    /// are left out.
    pub fn problems(&self) -> Vec<(Section, Vec<String>)> {
        let mut out = vec![
            (Section::Executables, self.executables.problems()),
            (Section::Preparation, self.preparation.problems()),
            (Section::Artifact, self.artifact.problems()),
        ];
        if let Some(transfer) = &self.transfer {
            out.push((Section::Transfer, transfer.problems()));
        }
        out.retain(|(_, p)| !p.is_empty());
        out
    }
}

/// Values are taken as written: backslashes and quotes have no special
/// meaning.
fn parse_option() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    }
}

/// One section, with option names folded to lower case.
struct SectionReader {
    section: Section,
    values: HashMap<String, String>,
}

impl SectionReader {
    fn new(ini: &Ini, section: Section) -> Result<SectionReader, ConfigError> {
        let props = ini
            .section(Some(section.name()))
            .ok_or_else(|| ConfigError::MissingSection(section.name().to_string()))?;
        let values = props
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .collect();
        Ok(SectionReader { section, values })
    }

    fn get(&self, key: &str) -> Result<String, ConfigError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey {
                section: self.section.name().to_string(),
                key: key.to_string(),
            })
    }
}

/// Split a `"RM,LT,VT"` style province list.  Order and duplicates are kept.
pub fn parse_provinces(value: &str) -> Result<Vec<String>, ConfigError> {
    let value = value.trim().trim_matches('"');
    if value.trim().is_empty() {
        return Err(ConfigError::NoProvince);
    }
    let provinces: Vec<String> = value.split(',').map(|p| p.trim().to_string()).collect();
    if provinces.iter().any(|p| p.is_empty()) {
        return Err(ConfigError::NoProvince);
    }
    Ok(provinces)
}

/// Untyped entry point: check a raw key/value section, picking the checks
/// from the keys it carries.  A run validates the typed sections of
/// [`WrapperConfig`] instead.  An empty section, one that matches no known
/// role, or one missing a key of its role is invalid.
pub fn validate_section(values: &HashMap<String, String>) -> bool {
    let Some(section) = Section::infer(values) else {
        return false;
    };
    let get = |key: &str| values.get(key).cloned().unwrap_or_default();
    let check: Box<dyn SectionCheck> = match section {
        Section::Executables => Box::new(ExecutableSet {
            downloader: get("db_download"),
            organizer: get("dataorganizer"),
            aggregator: get("mainelab"),
            converter: get("infoaria"),
        }),
        Section::Preparation => match parse_provinces(&get("provs")) {
            Ok(provinces) => Box::new(PreparationParams {
                config_path: get("ini_file"),
                delta_time: get("delta_time"),
                provinces,
                input_datafile: get("do_input_datafile"),
                output_dir: get("output_path"),
            }),
            Err(e) => {
                debug!("{} {}", section, e);
                return false;
            }
        },
        Section::Artifact => Box::new(ArtifactParams {
            sampling_points_file: get("sampling_point"),
            pollutant_file: get("pollutant_file"),
            station_file: get("station_file"),
            output_dir: get("output_path"),
            filename_suffix: get("output_file_suffix"),
            filename_extension: get("output_file_extension"),
        }),
        Section::Transfer => Box::new(TransferParams {
            server_address: get("server"),
            username: get("username"),
            password: get("password"),
            remote_directory: get("remote_path"),
        }),
    };
    if check.is_valid() {
        return true;
    }
    for p in check.problems() {
        debug!("{} {}", section, p);
    }
    false
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::fs;

    use jiff::civil::date;
    use tempfile::TempDir;

    use super::*;
    use crate::time_window::Hour;

    /// Scratch directory with every file the configuration points at.
    fn scaffold() -> Result<TempDir, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        for name in [
            "db_download.sh",
            "dataorganizer",
            "mainelab",
            "infoaria",
            "dataorganizer.ini",
            "sampling_points.csv",
            "pollutants.csv",
            "stations.csv",
        ] {
            fs::write(dir.path().join(name), "x")?;
        }
        fs::create_dir(dir.path().join("work"))?;
        fs::create_dir(dir.path().join("out"))?;
        Ok(dir)
    }

    fn ini_text(root: &Path, delta_time: &str, with_ftp: bool) -> String {
        let r = root.display();
        let mut s = format!(
            r#"[main]
dataorganizer = {r}/dataorganizer
mainelab = {r}/mainelab
infoaria = {r}/infoaria
db_download = {r}/db_download.sh

[dataorganizer]
ini_file = {r}/dataorganizer.ini
delta_time = {delta_time}
provs = "RM,LT,RM"
do_input_datafile = ecomanager.csv
output_path = {r}/work/

[infoaria]
sampling_point = {r}/sampling_points.csv
pollutant_file = {r}/pollutants.csv
station_file = {r}/stations.csv
output_path = {r}/out/
output_file_suffix = lazio_
output_file_extension = .txt
"#
        );
        if with_ftp {
            s.push_str(
                r#"
[ftp]
server = ftp.example.org
username = arpa
password = secret
remote_path = /incoming
"#,
            );
        }
        s
    }

    fn load_str(text: &str, with_transfer: bool) -> Result<WrapperConfig, ConfigError> {
        let ini = Ini::load_from_str_opt(text, parse_option()).map_err(|e| ConfigError::Syntax {
            path: "<memory>".to_string(),
            message: e.to_string(),
        })?;
        WrapperConfig::from_ini(&ini, with_transfer)
    }

    #[test]
    fn load_valid_config() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let path = dir.path().join("wrapper.ini");
        fs::write(&path, ini_text(dir.path(), "6", true))?;
        let config = WrapperConfig::load(&path, true)?;
        assert_eq!(config.preparation.provinces, vec!["RM", "LT", "RM"]);
        assert_eq!(config.preparation.delta_time, "6");
        assert_eq!(
            config.preparation.target_datafile(),
            format!("{}/work/ecomanager.csv", dir.path().display())
        );
        assert_eq!(
            config.transfer.as_ref().map(|t| t.remote_directory.as_str()),
            Some("/incoming")
        );
        assert!(config.problems().is_empty());
        assert!(config.executables.is_valid());
        assert!(config.artifact.is_valid());
        Ok(())
    }

    #[test]
    fn values_kept_as_written() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let path = dir.path().join("wrapper.ini");
        let mut text = ini_text(dir.path(), "3", false);
        text.push_str(
            r#"
[ftp]
Server = ftp.example.org
UserName = o'neil
PASSWORD = pa\ss\tb
remote_path = \incoming\new
"#,
        );
        fs::write(&path, text)?;
        let config = WrapperConfig::load(&path, true)?;
        let ftp = config.transfer.ok_or("no [ftp] section")?;
        assert_eq!(ftp.server_address, "ftp.example.org");
        assert_eq!(ftp.username, "o'neil");
        assert_eq!(ftp.password, r"pa\ss\tb");
        assert_eq!(ftp.remote_directory, r"\incoming\new");
        // the quoted province list still parses
        assert_eq!(config.preparation.provinces, vec!["RM", "LT", "RM"]);
        Ok(())
    }

    #[test]
    fn invalid_delta_time() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let config = load_str(&ini_text(dir.path(), "12", true), true)?;
        let problems = config.problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, Section::Preparation);
        assert!(problems[0].1[0].starts_with("delta_time"));
        Ok(())
    }

    #[test]
    fn missing_key_is_a_config_error() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let text = ini_text(dir.path(), "3", true).replace("station_file", "stations_file");
        match load_str(&text, true) {
            Err(ConfigError::MissingKey { section, key }) => {
                assert_eq!(section, "infoaria");
                assert_eq!(key, "station_file");
            }
            other => panic!("expected a missing key, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn transfer_section_optional_when_skipping_upload() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let text = ini_text(dir.path(), "24", false);
        assert!(matches!(
            load_str(&text, true),
            Err(ConfigError::MissingSection(s)) if s == "ftp"
        ));
        let config = load_str(&text, false)?;
        assert!(config.transfer.is_none());
        assert!(config.problems().is_empty());
        Ok(())
    }

    #[test]
    fn missing_files_are_reported() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        fs::remove_file(dir.path().join("mainelab"))?;
        fs::remove_dir(dir.path().join("out"))?;
        let config = load_str(&ini_text(dir.path(), "3", true), true)?;
        let sections: Vec<Section> = config.problems().into_iter().map(|(s, _)| s).collect();
        assert_eq!(sections, vec![Section::Executables, Section::Artifact]);
        Ok(())
    }

    #[test]
    fn empty_server_fails_transfer_check() {
        let params = TransferParams {
            server_address: String::new(),
            username: "u".to_string(),
            password: "p".to_string(),
            remote_directory: String::new(),
        };
        assert_eq!(params.problems().len(), 1);
        assert!(!params.is_valid());
        assert!(!format!("{:?}", params).contains("\"p\""));
    }

    #[test]
    fn artifact_path_uses_time_marker() -> Result<(), Box<dyn Error>> {
        let params = ArtifactParams {
            sampling_points_file: String::new(),
            pollutant_file: String::new(),
            station_file: String::new(),
            output_dir: "/data/out/".to_string(),
            filename_suffix: "lazio_".to_string(),
            filename_extension: ".txt".to_string(),
        };
        let window = TimeWindow::new(date(2019, 1, 1), date(2019, 1, 2), Hour::new(24)?)?;
        assert_eq!(
            params.artifact_path(&window),
            "/data/out/lazio_2019010200.txt"
        );
        Ok(())
    }

    #[test]
    fn parse_provinces_test() {
        assert_eq!(parse_provinces("\"RM,LT\"").unwrap(), vec!["RM", "LT"]);
        assert_eq!(parse_provinces("RM, VT ,RM").unwrap(), vec!["RM", "VT", "RM"]);
        assert!(matches!(parse_provinces("\"\""), Err(ConfigError::NoProvince)));
        assert!(matches!(parse_provinces("RM,,LT"), Err(ConfigError::NoProvince)));
    }

    #[test]
    fn validate_untyped_sections() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let root = dir.path().display().to_string();
        assert!(!validate_section(&HashMap::new()));

        let unknown: HashMap<String, String> =
            [("color".to_string(), "blue".to_string())].into_iter().collect();
        assert!(!validate_section(&unknown));

        let mut prep: HashMap<String, String> = [
            ("ini_file", format!("{root}/dataorganizer.ini")),
            ("delta_time", "3".to_string()),
            ("provs", "RM".to_string()),
            ("do_input_datafile", "data.csv".to_string()),
            ("output_path", format!("{root}/work/")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert!(validate_section(&prep));
        prep.insert("delta_time".to_string(), "12".to_string());
        assert!(!validate_section(&prep));

        let ftp: HashMap<String, String> = [
            ("server", ""),
            ("username", ""),
            ("password", ""),
            ("remote_path", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert!(!validate_section(&ftp));
        Ok(())
    }

    #[test]
    fn validate_executables_missing_a_key() -> Result<(), Box<dyn Error>> {
        let dir = scaffold()?;
        let root = dir.path().display().to_string();
        let mut main: HashMap<String, String> = [
            ("dataorganizer", "dataorganizer"),
            ("mainelab", "mainelab"),
            ("infoaria", "infoaria"),
            ("db_download", "db_download.sh"),
        ]
        .into_iter()
        .map(|(key, file)| (key.to_string(), format!("{root}/{file}")))
        .collect();
        assert!(validate_section(&main));
        main.remove("mainelab");
        assert!(!validate_section(&main));
        Ok(())
    }
}
