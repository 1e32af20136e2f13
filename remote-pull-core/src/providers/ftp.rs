//! FTP provider backed by the blocking `suppaftp` client.
//!
//! The session is opened at construction (connect, login, passive mode, binary
//! transfers, change to `root_path`); any failure there is a connection error.
//! FTP commands run on tokio's blocking pool with the session behind a mutex.

use std::net::ToSocketAddrs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::list::File;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream, Mode, Status};
use tokio::task;
use tracing::{debug, info, warn};

use super::{entries_from, fetch_each};
use crate::config::{ProviderConfig, ProviderContext};
use crate::contract::{
    DownloadResult, ObjectKind, Provider, ProviderFactory, RemoteClient, RemoteEntry, RemoteObject,
};
use crate::error::{BoxError, DownloadError};
use crate::paths;

pub const NAME: &str = "ftp";

/// Connection settings, all optional in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub root_path: String,
    pub timeout: Duration,
}

impl Default for FtpSettings {
    fn default() -> Self {
        FtpSettings {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: String::new(),
            root_path: ".".to_string(),
            timeout: Duration::from_secs(90),
        }
    }
}

impl FtpSettings {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, DownloadError> {
        let defaults = FtpSettings::default();
        let port = config.u64_or("port", u64::from(defaults.port))?;
        let port = u16::try_from(port).map_err(|_| DownloadError::Configuration {
            provider: NAME.to_string(),
            key: "port".to_string(),
            reason: format!("{port} is not a valid port"),
        })?;
        Ok(FtpSettings {
            host: config.string_or("host", &defaults.host),
            port,
            username: config.string_or("username", &defaults.username),
            password: config.string_or("password", &defaults.password),
            root_path: config.string_or("root_path", &defaults.root_path),
            timeout: Duration::from_secs(config.u64_or("timeout", defaults.timeout.as_secs())?),
        })
    }
}

/// Builds [`FtpProvider`]s; opens the FTP session while connecting.
#[derive(Debug, Default, Clone, Copy)]
pub struct FtpFactory;

#[async_trait]
impl ProviderFactory for FtpFactory {
    fn name(&self) -> &str {
        NAME
    }

    fn required_config_keys(&self) -> &[&'static str] {
        &[]
    }

    fn check_requirements(&self, config: &ProviderConfig) -> Result<(), DownloadError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DownloadError::Requirement {
                provider: NAME.to_string(),
                message: "FTP transfers need a tokio runtime".to_string(),
            });
        }
        FtpSettings::from_config(config).map(|_| ())
    }

    async fn connect(&self, context: ProviderContext) -> Result<Box<dyn Provider>, DownloadError> {
        let settings = FtpSettings::from_config(&context.config)?;
        let client = FtpClient::connect(settings).await?;
        Ok(Box::new(FtpProvider::new(context, Arc::new(client))))
    }
}

/// Recursively lists and fetches the files of a remote directory.
pub struct FtpProvider {
    context: ProviderContext,
    client: Arc<dyn RemoteClient>,
}

impl FtpProvider {
    pub fn new(context: ProviderContext, client: Arc<dyn RemoteClient>) -> Self {
        FtpProvider { context, client }
    }
}

#[async_trait]
impl Provider for FtpProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn context(&self) -> &ProviderContext {
        &self.context
    }

    async fn get_list(&self) -> Result<Vec<RemoteEntry>, DownloadError> {
        let remote_dir = &self.context.remote_dir;
        let objects = self
            .client
            .list(remote_dir)
            .await
            .map_err(|e| DownloadError::connection(NAME, e))?;
        let listed = objects.len();
        let entries = entries_from(remote_dir, objects, |object| {
            object.kind == ObjectKind::File
        });
        info!(remote_dir = %remote_dir, listed, selected = entries.len(), "[DOWNLOAD] Scanned FTP tree");
        Ok(entries)
    }

    async fn perform_download(&self, entries: &[RemoteEntry]) -> DownloadResult {
        fetch_each(&self.context, self.client.as_ref(), entries).await
    }
}

/// [`RemoteClient`] over one FTP session.
pub struct FtpClient {
    session: Arc<Mutex<FtpStream>>,
}

impl FtpClient {
    pub async fn connect(settings: FtpSettings) -> Result<Self, DownloadError> {
        let stream = task::spawn_blocking(move || open_session(&settings))
            .await
            .map_err(|e| DownloadError::connection(NAME, e))??;
        Ok(FtpClient {
            session: Arc::new(Mutex::new(stream)),
        })
    }

    async fn with_session<T, F>(&self, op: F) -> Result<T, BoxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, BoxError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        task::spawn_blocking(move || {
            let mut stream = session
                .lock()
                .map_err(|_| BoxError::from("FTP session lock poisoned"))?;
            op(&mut *stream)
        })
        .await?
    }
}

fn open_session(settings: &FtpSettings) -> Result<FtpStream, DownloadError> {
    let endpoint = format!("{}:{}", settings.host, settings.port);
    let fail = |stage: &str, e: &dyn std::fmt::Display| {
        DownloadError::connection(NAME, format!("{stage} {endpoint}: {e}"))
    };

    let address = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| fail("cannot resolve", &e))?
        .next()
        .ok_or_else(|| fail("no address for", &"empty resolution"))?;

    let mut stream =
        FtpStream::connect_timeout(address, settings.timeout).map_err(|e| fail("cannot connect to", &e))?;
    stream
        .get_ref()
        .set_read_timeout(Some(settings.timeout))
        .map_err(|e| fail("cannot set read timeout on", &e))?;
    stream
        .get_ref()
        .set_write_timeout(Some(settings.timeout))
        .map_err(|e| fail("cannot set write timeout on", &e))?;
    stream
        .login(settings.username.as_str(), settings.password.as_str())
        .map_err(|e| fail("login rejected by", &e))?;
    stream.set_mode(Mode::Passive);
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| fail("binary mode refused by", &e))?;
    stream
        .cwd(settings.root_path.as_str())
        .map_err(|e| fail(&format!("cannot change to {} on", settings.root_path), &e))?;

    info!(endpoint = %endpoint, root_path = %settings.root_path, "Opened FTP session");
    Ok(stream)
}

fn is_missing(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable)
}

/// Walk the tree below `root`, listing each directory through `list`.
///
/// A missing `root` yields nothing and a failing `root` listing is returned as
/// an error. Failing sub-directories are skipped.
fn scan<L>(mut list: L, root: &str) -> Result<Vec<RemoteObject>, FtpError>
where
    L: FnMut(Option<&str>) -> FtpResult<Vec<String>>,
{
    let mut objects = Vec::new();
    let mut pending = vec![root.to_string()];
    let mut top_level = true;

    while let Some(dir) = pending.pop() {
        let listing = if dir.is_empty() {
            list(None)
        } else {
            list(Some(dir.as_str()))
        };
        let lines = match listing {
            Ok(lines) => lines,
            Err(e) if is_missing(&e) => {
                debug!(dir = %dir, "Remote directory does not exist");
                top_level = false;
                continue;
            }
            Err(e) if top_level => return Err(e),
            Err(e) => {
                warn!(dir = %dir, error = %e, "[DOWNLOAD] Skipping unreadable FTP directory");
                continue;
            }
        };
        top_level = false;

        for line in lines {
            let file = match File::from_str(&line) {
                Ok(file) => file,
                Err(e) => {
                    debug!(line = %line, error = ?e, "Skipping unparsable LIST line");
                    continue;
                }
            };
            let name = file.name();
            if name == "." || name == ".." {
                continue;
            }
            let key = paths::join_remote(&dir, name);
            if file.is_directory() {
                pending.push(key.clone());
                objects.push(RemoteObject {
                    key,
                    size: 0,
                    kind: ObjectKind::Directory,
                });
            } else if file.is_file() {
                objects.push(RemoteObject {
                    key,
                    size: file.size() as u64,
                    kind: ObjectKind::File,
                });
            }
        }
    }

    Ok(objects)
}

#[async_trait]
impl RemoteClient for FtpClient {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BoxError> {
        let root = paths::normalize_remote_dir(prefix);
        self.with_session(move |stream| Ok(scan(|dir| stream.list(dir), &root)?))
            .await
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), BoxError> {
        let key = key.to_string();
        let dest = dest.to_path_buf();
        self.with_session(move |stream| {
            let data = stream.retr_as_buffer(&key)?;
            std::fs::write(&dest, data.into_inner())?;
            Ok(())
        })
        .await
    }
}

fn quit(session: &Mutex<FtpStream>) {
    if let Ok(mut stream) = session.lock() {
        if let Err(e) = stream.quit() {
            debug!(error = %e, "FTP QUIT failed");
        }
    }
}

impl Drop for FtpClient {
    /// QUIT waits for the server's reply, so inside a runtime it is sent from the blocking pool.
    fn drop(&mut self) {
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || quit(&session));
            }
            Err(_) => quit(&session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::contract::MockRemoteClient;
    use crate::notify::MemoryNotifier;
    use serde_json::{json, Map};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Instant;
    use suppaftp::types::Response;

    fn config(explicit: Map<String, serde_json::Value>) -> ProviderConfig {
        ProviderConfig::new(NAME, explicit, Arc::new(Settings::default()))
    }

    #[test]
    fn settings_default_when_unconfigured() {
        let settings = FtpSettings::from_config(&config(Map::new())).unwrap();
        assert_eq!(settings, FtpSettings::default());
        assert_eq!(settings.port, 21);
        assert_eq!(settings.root_path, ".");
        assert_eq!(settings.timeout, Duration::from_secs(90));
    }

    #[test]
    fn settings_come_from_named_variables() {
        let mut settings = Settings::default();
        settings.set_variable(NAME, "host", "ftp.example.org");
        settings.set_variable(NAME, "port", 2121);
        let mut explicit = Map::new();
        explicit.insert("timeout".into(), json!("5"));
        let config = ProviderConfig::new(NAME, explicit, Arc::new(settings));

        let ftp = FtpSettings::from_config(&config).unwrap();
        assert_eq!(ftp.host, "ftp.example.org");
        assert_eq!(ftp.port, 2121);
        assert_eq!(ftp.timeout, Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut explicit = Map::new();
        explicit.insert("port".into(), json!(70000));
        let err = FtpSettings::from_config(&config(explicit)).unwrap_err();
        assert!(matches!(err, DownloadError::Configuration { ref key, .. } if key == "port"));
    }

    #[tokio::test]
    async fn listing_keeps_files_only() {
        let mut client = MockRemoteClient::new();
        client
            .expect_list()
            .withf(|prefix| prefix == "incoming")
            .returning(|_| {
                Ok(vec![
                    RemoteObject {
                        key: "incoming/a.jpg".into(),
                        size: 3,
                        kind: ObjectKind::File,
                    },
                    RemoteObject {
                        key: "incoming/sub".into(),
                        size: 0,
                        kind: ObjectKind::Directory,
                    },
                    RemoteObject {
                        key: "incoming/sub/b.jpg".into(),
                        size: 0,
                        kind: ObjectKind::File,
                    },
                ])
            });
        let context = ProviderContext {
            provider: NAME.into(),
            remote_dir: "incoming".into(),
            local_dir: "/tmp/unused".into(),
            managed: false,
            verbose: false,
            concurrency: 1,
            config: config(Map::new()),
            notifier: Arc::new(MemoryNotifier::new()),
        };

        let provider = FtpProvider::new(context, Arc::new(client));
        let entries = provider.get_list().await.unwrap();

        let relative: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(relative, vec!["a.jpg", "sub/b.jpg"]);
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let settings = FtpSettings {
            host: "127.0.0.1".into(),
            port: 1,
            timeout: Duration::from_secs(2),
            ..FtpSettings::default()
        };
        let err = FtpClient::connect(settings).await.err().unwrap();
        assert!(matches!(err, DownloadError::Connection { ref provider, .. } if provider == "ftp"));
    }

    fn dir_line(name: &str) -> String {
        format!("drwxr-xr-x 2 ftp ftp 4096 Nov 5 2018 {name}")
    }

    fn file_line(name: &str, size: u64) -> String {
        format!("-rw-r--r-- 1 ftp ftp {size} Nov 5 13:46 {name}")
    }

    fn missing() -> FtpError {
        FtpError::UnexpectedResponse(Response::new(
            Status::FileUnavailable,
            b"550 No such file or directory\r\n".to_vec(),
        ))
    }

    fn reset() -> FtpError {
        FtpError::ConnectionError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    fn object(key: &str, size: u64, kind: ObjectKind) -> RemoteObject {
        RemoteObject {
            key: key.into(),
            size,
            kind,
        }
    }

    #[test]
    fn scan_recurses_and_skips_dot_entries_and_garbage() {
        let mut listed = Vec::new();
        let objects = scan(
            |dir| {
                listed.push(dir.map(str::to_string));
                match dir {
                    Some("incoming") => Ok(vec![
                        "total 3".to_string(),
                        dir_line("."),
                        dir_line(".."),
                        file_line("a.jpg", 4),
                        dir_line("sub"),
                    ]),
                    Some("incoming/sub") => Ok(vec![file_line("b.jpg", 7)]),
                    other => panic!("unexpected listing of {other:?}"),
                }
            },
            "incoming",
        )
        .unwrap();

        assert_eq!(
            objects,
            vec![
                object("incoming/a.jpg", 4, ObjectKind::File),
                object("incoming/sub", 0, ObjectKind::Directory),
                object("incoming/sub/b.jpg", 7, ObjectKind::File),
            ]
        );
        assert_eq!(
            listed,
            vec![Some("incoming".to_string()), Some("incoming/sub".to_string())]
        );
    }

    #[test]
    fn scan_of_the_remote_root_lists_the_working_directory() {
        let objects = scan(
            |dir| match dir {
                None => Ok(vec![file_line("a.jpg", 1)]),
                Some(other) => panic!("unexpected listing of {other}"),
            },
            "",
        )
        .unwrap();
        assert_eq!(objects, vec![object("a.jpg", 1, ObjectKind::File)]);
    }

    #[test]
    fn missing_root_scans_as_empty() {
        let objects = scan(|_| Err(missing()), "incoming").unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn failing_root_listing_is_returned() {
        let err = scan(|_| Err(reset()), "incoming").unwrap_err();
        assert!(matches!(err, FtpError::ConnectionError(_)));
    }

    #[test]
    fn unreadable_or_missing_subdirectories_are_skipped() {
        let objects = scan(
            |dir| match dir {
                Some("in") => Ok(vec![
                    dir_line("broken"),
                    dir_line("gone"),
                    file_line("a.jpg", 2),
                ]),
                Some("in/broken") => Err(reset()),
                Some("in/gone") => Err(missing()),
                other => panic!("unexpected listing of {other:?}"),
            },
            "in",
        )
        .unwrap();

        let files: Vec<_> = objects
            .iter()
            .filter(|o| o.kind == ObjectKind::File)
            .map(|o| o.key.as_str())
            .collect();
        assert_eq!(files, vec!["in/a.jpg"]);
    }

    #[tokio::test]
    async fn failing_listing_is_a_connection_error() {
        let mut client = MockRemoteClient::new();
        client
            .expect_list()
            .returning(|_| Err("530 Not logged in".into()));
        let context = ProviderContext {
            provider: NAME.into(),
            remote_dir: "incoming".into(),
            local_dir: "/tmp/unused".into(),
            managed: false,
            verbose: false,
            concurrency: 1,
            config: config(Map::new()),
            notifier: Arc::new(MemoryNotifier::new()),
        };

        let err = FtpProvider::new(context, Arc::new(client))
            .get_list()
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Connection { ref provider, .. } if provider == "ftp"));
    }

    /// Minimal control-channel server that answers the session setup and delays
    /// its QUIT reply. Returns the port and a handle yielding the received commands.
    fn slow_quit_server(quit_delay: Duration) -> (u16, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writer.write_all(b"220 ready\r\n").unwrap();

            let mut commands = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let command = line.trim_end().to_string();
                line.clear();
                let reply: &[u8] = match command.split(' ').next().unwrap_or("") {
                    "USER" => b"230 logged in\r\n",
                    "TYPE" => b"200 ok\r\n",
                    "CWD" => b"250 ok\r\n",
                    "QUIT" => {
                        std::thread::sleep(quit_delay);
                        b"221 bye\r\n"
                    }
                    _ => b"502 not implemented\r\n",
                };
                commands.push(command);
                if writer.write_all(reply).is_err() {
                    break;
                }
            }
            commands
        });
        (port, handle)
    }

    #[tokio::test]
    async fn dropping_the_client_does_not_wait_for_quit() {
        let (port, server) = slow_quit_server(Duration::from_secs(2));
        let client = FtpClient::connect(FtpSettings {
            host: "127.0.0.1".into(),
            port,
            timeout: Duration::from_secs(5),
            ..FtpSettings::default()
        })
        .await
        .unwrap();

        let started = Instant::now();
        drop(client);
        assert!(started.elapsed() < Duration::from_secs(1));

        let commands = task::spawn_blocking(move || server.join().unwrap())
            .await
            .unwrap();
        assert_eq!(commands.first().map(String::as_str), Some("USER anonymous"));
        assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
    }
}
