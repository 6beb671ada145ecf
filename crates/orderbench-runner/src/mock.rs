//! Scripted in-memory transport for tests.
//!
//! Records every connect/exec/transfer/probe and answers commands through a
//! caller-supplied responder, so fleet and trial logic can be exercised
//! without real workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Credentials;
use crate::transport::{Connection, Transport};

/// What the mock does with one `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Exit { code: i32, output: String },
    TransportError(String),
}

impl MockReply {
    pub fn ok(output: &str) -> Self {
        Self::exit(0, output)
    }

    pub fn exit(code: i32, output: &str) -> Self {
        MockReply::Exit {
            code,
            output: output.to_string(),
        }
    }

    pub fn transport_error() -> Self {
        MockReply::TransportError("channel closed".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect { host: String },
    Exec { host: String, command: String },
    Put { host: String, remote: String, content: String },
    Get { host: String, remote: String, recursive: bool },
    Probe { host: String },
}

#[derive(Debug, Clone)]
enum RemoteEntry {
    File(String),
    Dir(Vec<(String, String)>),
}

type Responder = dyn Fn(&str, &str) -> MockReply + Send + Sync;

#[derive(Default)]
struct MockState {
    connect_failures: HashMap<String, u32>,
    rejected_keys: HashSet<String>,
    probes: HashMap<String, VecDeque<bool>>,
    remote: HashMap<(String, String), RemoteEntry>,
    events: Vec<MockEvent>,
}

/// A test double for [`Transport`]. Clones share recorded state.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    responder: Arc<Responder>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Every command succeeds with no output; every host is reachable.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            responder: Arc::new(|_, _| MockReply::ok("")),
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str, &str) -> MockReply + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// The next `failures` connects to `host` are refused.
    pub fn fail_connect(self, host: &str, failures: u32) -> Self {
        self.lock()
            .connect_failures
            .insert(host.to_string(), failures);
        self
    }

    /// Every connect to `host` fails authentication.
    pub fn reject_key(self, host: &str) -> Self {
        self.lock().rejected_keys.insert(host.to_string());
        self
    }

    /// Answers for successive reachability probes of `host`; once the script
    /// runs out the host reads as reachable.
    pub fn probe_script(self, host: &str, answers: Vec<bool>) -> Self {
        self.lock()
            .probes
            .insert(host.to_string(), answers.into_iter().collect());
        self
    }

    pub fn serve_file(self, host: &str, remote: &str, content: &str) -> Self {
        self.lock().remote.insert(
            (host.to_string(), remote.to_string()),
            RemoteEntry::File(content.to_string()),
        );
        self
    }

    /// Serves `remote` as a directory holding `files` (name, content).
    pub fn serve_dir(self, host: &str, remote: &str, files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_string()))
            .collect();
        self.lock().remote.insert(
            (host.to_string(), remote.to_string()),
            RemoteEntry::Dir(files),
        );
        self
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Commands executed on `host`, in order.
    pub fn executed(&self, host: &str) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Exec { host: h, command } if h == host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_attempts(&self, host: &str) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Connect { host: h } if h == host))
            .count()
    }

    /// Uploads to `host` as (remote path, content).
    pub fn uploads(&self, host: &str) -> Vec<(String, String)> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Put {
                    host: h,
                    remote,
                    content,
                } if h == host => Some((remote.clone(), content.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn probes(&self, host: &str) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Probe { host: h } if h == host))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        host: &str,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> io::Result<Box<dyn Connection>> {
        let mut state = self.lock();
        state.events.push(MockEvent::Connect {
            host: host.to_string(),
        });
        if state.rejected_keys.contains(host) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("mock: {} rejected the key", host),
            ));
        }
        if let Some(remaining) = state.connect_failures.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("mock: {} refused connection", host),
                ));
            }
        }
        Ok(Box::new(MockConnection {
            host: host.to_string(),
            transport: self.clone(),
        }))
    }

    fn is_reachable(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
        let mut state = self.lock();
        state.events.push(MockEvent::Probe {
            host: host.to_string(),
        });
        state
            .probes
            .get_mut(host)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true)
    }
}

struct MockConnection {
    host: String,
    transport: MockTransport,
}

impl Connection for MockConnection {
    fn exec(&mut self, command: &str, on_line: &mut dyn FnMut(&str)) -> io::Result<i32> {
        self.transport.lock().events.push(MockEvent::Exec {
            host: self.host.clone(),
            command: command.to_string(),
        });
        match (self.transport.responder)(&self.host, command) {
            MockReply::Exit { code, output } => {
                for line in output.lines() {
                    on_line(line);
                }
                Ok(code)
            }
            MockReply::TransportError(reason) => {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason))
            }
        }
    }

    fn put(&mut self, local: &Path, remote: &str) -> io::Result<()> {
        let content = fs::read_to_string(local)?;
        self.transport.lock().events.push(MockEvent::Put {
            host: self.host.clone(),
            remote: remote.to_string(),
            content,
        });
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path, recursive: bool) -> io::Result<()> {
        let entry = {
            let mut state = self.transport.lock();
            state.events.push(MockEvent::Get {
                host: self.host.clone(),
                remote: remote.to_string(),
                recursive,
            });
            state
                .remote
                .get(&(self.host.clone(), remote.to_string()))
                .cloned()
        };
        match entry {
            Some(RemoteEntry::File(content)) => fs::write(local, content),
            Some(RemoteEntry::Dir(files)) if recursive => {
                fs::create_dir_all(local)?;
                for (name, content) in files {
                    fs::write(local.join(name), content)?;
                }
                Ok(())
            }
            Some(RemoteEntry::Dir(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mock: {} is a directory", remote),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock: no such remote path {}:{}", self.host, remote),
            )),
        }
    }
}
