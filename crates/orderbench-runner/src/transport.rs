//! Remote transport capability.
//!
//! The engine talks to workers only through [`Transport`] and
//! [`Connection`]. Production runs use [`OpenSshTransport`], which drives
//! the system `ssh`/`scp` binaries; tests use [`crate::mock::MockTransport`].

use std::io::{self, BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::Credentials;

/// `ssh` reserves this exit status for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> io::Result<Box<dyn Connection>>;

    /// TCP reachability check against `host:port`.
    fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

pub trait Connection: Send {
    /// Runs `command` on a fresh channel, handing each line of merged
    /// stdout/stderr to `on_line`. Blocks until the exit status is known.
    fn exec(&mut self, command: &str, on_line: &mut dyn FnMut(&str)) -> io::Result<i32>;

    fn put(&mut self, local: &Path, remote: &str) -> io::Result<()>;

    fn get(&mut self, remote: &str, local: &Path, recursive: bool) -> io::Result<()>;

    fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh: PathBuf,
    scp: PathBuf,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSshTransport {
    pub fn new() -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            scp: PathBuf::from("scp"),
        }
    }

    /// Uses `ssh` and `scp` from explicit paths instead of `PATH`.
    pub fn with_programs(ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        Self {
            ssh: ssh.into(),
            scp: scp.into(),
        }
    }
}

/// Feeds each `\n`-terminated line of `reader` to `on_line`, replacing
/// invalid UTF-8 instead of failing on it.
fn stream_lines(mut reader: impl BufRead, on_line: &mut dyn FnMut(&str)) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn ssh_opts(credentials: &Credentials, timeout: Duration) -> Vec<String> {
    vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-i".into(),
        credentials.keyfile.to_string_lossy().into(),
    ]
}

impl Transport for OpenSshTransport {
    fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> io::Result<Box<dyn Connection>> {
        let output = Command::new(&self.ssh)
            .args(ssh_opts(credentials, timeout))
            .arg("-p")
            .arg(credentials.port.to_string())
            .arg(format!("{}@{}", credentials.user, host))
            .arg("true")
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = if stderr.contains("Permission denied") {
                io::ErrorKind::PermissionDenied
            } else {
                io::ErrorKind::ConnectionRefused
            };
            return Err(io::Error::new(
                kind,
                format!("ssh to {}: {}", host, stderr.trim()),
            ));
        }
        Ok(Box::new(OpenSshConnection {
            host: host.to_string(),
            credentials: credentials.clone(),
            timeout,
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
        }))
    }

    fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
    }
}

struct OpenSshConnection {
    host: String,
    credentials: Credentials,
    timeout: Duration,
    ssh: PathBuf,
    scp: PathBuf,
}

impl OpenSshConnection {
    fn target(&self) -> String {
        format!("{}@{}", self.credentials.user, self.host)
    }

    fn scp(&self, recursive: bool, from: &str, to: &str) -> io::Result<()> {
        let mut cmd = Command::new(&self.scp);
        cmd.args(ssh_opts(&self.credentials, self.timeout))
            .arg("-P")
            .arg(self.credentials.port.to_string());
        if recursive {
            cmd.arg("-r");
        }
        let output = cmd.arg(from).arg(to).stdin(Stdio::null()).output()?;
        if output.status.success() {
            Ok(())
        } else {
            let mut merged = String::from_utf8_lossy(&output.stdout).to_string();
            merged.push_str(&String::from_utf8_lossy(&output.stderr));
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("scp {} -> {}: {}", from, to, merged.trim()),
            ))
        }
    }
}

impl Connection for OpenSshConnection {
    fn exec(&mut self, command: &str, on_line: &mut dyn FnMut(&str)) -> io::Result<i32> {
        let mut child = Command::new(&self.ssh)
            .args(ssh_opts(&self.credentials, self.timeout))
            .arg("-p")
            .arg(self.credentials.port.to_string())
            .arg(self.target())
            .arg(format!("( {} ) 2>&1", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let streamed = match child.stdout.take() {
            Some(stdout) => stream_lines(BufReader::new(stdout), on_line),
            None => Ok(()),
        };
        if streamed.is_err() {
            let _ = child.kill();
        }
        let mut ssh_stderr = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_end(&mut ssh_stderr);
        }
        let status = child.wait()?;
        streamed?;
        let ssh_stderr = String::from_utf8_lossy(&ssh_stderr);
        match status.code() {
            Some(SSH_TRANSPORT_FAILURE) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("ssh transport failure on {}: {}", self.host, ssh_stderr.trim()),
            )),
            Some(code) => Ok(code),
            None => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("ssh to {} terminated by signal", self.host),
            )),
        }
    }

    fn put(&mut self, local: &Path, remote: &str) -> io::Result<()> {
        let to = format!("{}:{}", self.target(), remote);
        self.scp(false, &local.to_string_lossy(), &to)
    }

    fn get(&mut self, remote: &str, local: &Path, recursive: bool) -> io::Result<()> {
        let from = format!("{}:{}", self.target(), remote);
        self.scp(recursive, &from, &local.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn creds() -> Credentials {
        Credentials {
            user: "alice".into(),
            keyfile: PathBuf::from("/keys/id_ed25519"),
            port: 22,
        }
    }

    #[test]
    fn ssh_opts_are_non_interactive() {
        let opts = ssh_opts(&creds(), Duration::from_secs(10));
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(opts.last().map(String::as_str), Some("/keys/id_ed25519"));
    }

    #[test]
    fn connect_timeout_never_rounds_to_zero() {
        let opts = ssh_opts(&creds(), Duration::from_millis(200));
        assert!(opts.contains(&"ConnectTimeout=1".to_string()));
    }

    /// Writes an executable `ssh` stand-in that succeeds on the `true`
    /// handshake and otherwise runs `body`.
    #[cfg(unix)]
    fn fake_ssh(tag: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!(
            "orderbench_fake_ssh_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("ssh");
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\nif [ \"$last\" = true ]; then exit 0; fi\n{}\n",
            body
        );
        std::fs::write(&path, script).expect("script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    fn exec_with(ssh: &Path, command: &str) -> (io::Result<i32>, Vec<String>) {
        let transport = OpenSshTransport::with_programs(ssh, "scp");
        let mut conn = transport
            .connect("n0", &creds(), Duration::from_secs(1))
            .expect("connect");
        let mut lines = Vec::new();
        let result = conn.exec(command, &mut |l| lines.push(l.to_string()));
        (result, lines)
    }

    #[cfg(unix)]
    #[test]
    fn invalid_utf8_output_is_replaced_not_fatal() {
        let ssh = fake_ssh("utf8", "printf 'ok\\n\\377\\376\\n'\nexit 0");
        let (result, lines) = exec_with(&ssh, "bench");
        assert_eq!(result.expect("exit status"), 0);
        assert_eq!(lines, vec!["ok".to_string(), "\u{fffd}\u{fffd}".to_string()]);
        let _ = std::fs::remove_dir_all(ssh.parent().expect("dir"));
    }

    #[cfg(unix)]
    #[test]
    fn remote_exit_status_passes_through_and_255_is_transport() {
        let ssh = fake_ssh("status", "echo partial\nexit 3");
        let (result, lines) = exec_with(&ssh, "bench");
        assert_eq!(result.expect("exit status"), 3);
        assert_eq!(lines, vec!["partial".to_string()]);
        let _ = std::fs::remove_dir_all(ssh.parent().expect("dir"));

        let ssh = fake_ssh("status255", "echo 'Connection reset' >&2\nexit 255");
        let (result, _) = exec_with(&ssh, "bench");
        let err = result.expect_err("transport failure");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(err.to_string().contains("Connection reset"));
        let _ = std::fs::remove_dir_all(ssh.parent().expect("dir"));
    }

    #[cfg(unix)]
    #[test]
    fn rejected_key_is_permission_denied() {
        let ssh = fake_ssh("denied", "");
        let script = "#!/bin/sh\necho 'alice@n0: Permission denied (publickey).' >&2\nexit 255\n";
        std::fs::write(&ssh, script).expect("script");
        let err = OpenSshTransport::with_programs(&ssh, "scp")
            .connect("n0", &creds(), Duration::from_secs(1))
            .err()
            .expect("denied");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let _ = std::fs::remove_dir_all(ssh.parent().expect("dir"));
    }

    #[test]
    fn stream_lines_strips_line_endings() {
        let mut lines = Vec::new();
        stream_lines(&b"a\r\nb\nlast"[..], &mut |l| lines.push(l.to_string())).expect("read");
        assert_eq!(lines, vec!["a", "b", "last"]);
    }

    #[test]
    fn closed_port_is_unreachable() {
        let transport = OpenSshTransport::new();
        assert!(!transport.is_reachable("127.0.0.1", 1, Duration::from_millis(200)));
    }
}
