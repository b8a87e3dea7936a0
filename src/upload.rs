use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::net::ToSocketAddrs;
use std::time::Duration;

use log::{debug, error, info, warn};
use suppaftp::types::{FileType, FormatControl};
use suppaftp::{FtpError, FtpStream, Mode};
use thiserror::Error;

use crate::config::TransferParams;

pub const FTP_PORT: u16 = 21;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No FTP server address")]
    NoServer,
    #[error("No data to transmit")]
    NoFiles,
    #[error("Cannot resolve FTP server address {0}")]
    Resolve(String),
    #[error("Cowardly refusing to transmit an empty string")]
    EmptyPath,
    #[error("Error during FTP transmission: {0}")]
    Ftp(#[from] FtpError),
    #[error("Error during FILE operation: {0}")]
    Io(#[from] io::Error),
}

/// An open, authenticated session sitting in the target directory.
pub trait FtpSession {
    /// Store the content under `name` in the current remote directory.
    fn store(&mut self, name: &str, data: &mut dyn Read) -> Result<(), UploadError>;
    /// Close the session.  Errors are ignored.
    fn close(&mut self);
}

/// Opens sessions: connect, log in, go passive and change directory.
pub trait Connector {
    type Session: FtpSession;
    fn open(&mut self, params: &TransferParams) -> Result<Self::Session, UploadError>;
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for FtpConnector {
    fn default() -> Self {
        FtpConnector {
            port: FTP_PORT,
            timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Connector for FtpConnector {
    type Session = FtpStream;

    fn open(&mut self, params: &TransferParams) -> Result<FtpStream, UploadError> {
        info!("Connecting to {}", params.server_address);
        let addr = (params.server_address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| UploadError::Resolve(params.server_address.clone()))?
            .next()
            .ok_or_else(|| UploadError::Resolve(params.server_address.clone()))?;
        let mut ftp = FtpStream::connect_timeout(addr, self.timeout)?;
        let setup = |ftp: &mut FtpStream| -> Result<(), FtpError> {
            ftp.login(&params.username, &params.password)?;
            ftp.set_mode(Mode::Passive);
            if !params.remote_directory.is_empty() {
                info!("Moving into remote dir: {}", params.remote_directory);
                ftp.cwd(&params.remote_directory)?;
            }
            ftp.transfer_type(FileType::Ascii(FormatControl::Default))
        };
        if let Err(e) = setup(&mut ftp) {
            let _ = ftp.quit();
            return Err(e.into());
        }
        Ok(ftp)
    }
}

impl FtpSession for FtpStream {
    fn store(&mut self, name: &str, mut data: &mut dyn Read) -> Result<(), UploadError> {
        let bytes = self.put_file(name, &mut data)?;
        debug!("Stored {} bytes as {}", bytes, name);
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.quit() {
            debug!("QUIT failed: {}", e);
        }
    }
}

/// Per-file result of one upload, in the order the files were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub per_file: Vec<(String, bool)>,
    pub overall: bool,
}

impl TransferOutcome {
    pub fn failed() -> TransferOutcome {
        TransferOutcome {
            per_file: vec![],
            overall: false,
        }
    }

    fn from_attempts(per_file: Vec<(String, bool)>) -> TransferOutcome {
        let overall = !per_file.is_empty() && per_file.iter().all(|(_, ok)| *ok);
        TransferOutcome { per_file, overall }
    }

    pub fn failed_files(&self) -> Vec<&str> {
        self.per_file
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(p, _)| p.as_str())
            .collect()
    }
}

/// Name under which a local file is stored remotely: the local path without
/// its directories.
pub fn remote_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Read a text file line by line, terminating every line with CRLF as FTP
/// ASCII transfers expect.
fn read_crlf(path: &str) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    Ok(out)
}

fn store_one<S: FtpSession>(session: &mut S, path: &str) -> Result<(), UploadError> {
    if path.is_empty() {
        return Err(UploadError::EmptyPath);
    }
    info!("Uploading file: {}", path);
    let name = remote_name(path);
    if name.is_empty() {
        return Err(UploadError::EmptyPath);
    }
    let data = read_crlf(path)?;
    session.store(name, &mut Cursor::new(data))
}

/// Send every file over one session.  A failing file does not stop the
/// others, but makes the whole outcome a failure.
pub fn upload<C: Connector>(
    connector: &mut C,
    params: &TransferParams,
    files: &[String],
) -> TransferOutcome {
    if params.server_address.is_empty() {
        error!("{}", UploadError::NoServer);
        return TransferOutcome::failed();
    }
    if files.is_empty() {
        error!("{}", UploadError::NoFiles);
        return TransferOutcome::failed();
    }
    let mut session = match connector.open(params) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return TransferOutcome::failed();
        }
    };

    let per_file = files
        .iter()
        .map(|path| match store_one(&mut session, path) {
            Ok(()) => (path.clone(), true),
            Err(UploadError::EmptyPath) => {
                error!("{}...", UploadError::EmptyPath);
                (path.clone(), false)
            }
            Err(e) => {
                error!("Error transferring file {}", path);
                error!("{}", e);
                (path.clone(), false)
            }
        })
        .collect();

    info!("Closing connection to {}", params.server_address);
    session.close();
    let outcome = TransferOutcome::from_attempts(per_file);
    if !outcome.overall {
        warn!("{} file(s) not transmitted", outcome.failed_files().len());
    }
    outcome
}
