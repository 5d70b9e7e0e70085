//! How a child process is reached
//!
//! Every transport shares one bootstrap sequence and differs only in the
//! argv wrapped around the runtime command and in which early output
//! counts as a password prompt. [`Method`] is the serializable selection
//! of a transport, so it can also travel inside a proxied connect request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prompt passed to `sudo -p` so it can be recognised reliably
const SUDO_PROMPT: &str = "tether sudo password: ";

/// Capabilities a transport contributes to the bootstrap
pub trait Transport {
    /// Wrap the runtime command line for this transport
    fn build_argv(&self, inner: &[String]) -> Vec<String>;

    /// Whether `output` ends with a password prompt
    fn is_password_prompt(&self, _output: &[u8]) -> bool {
        false
    }

    /// Whether the child runs on another machine, where the parent's
    /// executable path means nothing
    fn is_remote(&self) -> bool {
        false
    }
}

/// Run the runtime directly
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Local;

impl Transport for Local {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        inner.to_vec()
    }
}

/// Run the runtime on another host through the OpenSSH client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssh {
    pub hostname: String,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Defaults to `ssh` on `PATH`
    pub ssh_path: Option<String>,
    /// When false, unknown host keys are accepted
    pub check_host_keys: bool,
}

impl Transport for Ssh {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        let mut argv = vec![self.ssh_path.clone().unwrap_or_else(|| "ssh".to_string())];
        argv.extend(["-o".to_string(), "LogLevel=ERROR".to_string()]);
        if !self.check_host_keys {
            argv.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }
        if let Some(user) = &self.username {
            argv.extend(["-l".to_string(), user.clone()]);
        }
        if let Some(port) = self.port {
            argv.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.identity_file {
            argv.extend(["-i".to_string(), identity.display().to_string()]);
        }
        argv.push(self.hostname.clone());
        // The remote side hands the command to a shell
        argv.push(shell_join(inner));
        argv
    }

    fn is_password_prompt(&self, output: &[u8]) -> bool {
        let tail = last_line(output).to_lowercase();
        tail.ends_with("password:") || tail.starts_with("enter passphrase for key")
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Become another user with sudo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sudo {
    /// Defaults to root
    pub username: Option<String>,
    pub sudo_path: Option<String>,
}

impl Transport for Sudo {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        let mut argv = vec![self.sudo_path.clone().unwrap_or_else(|| "sudo".to_string())];
        argv.extend([
            "-u".to_string(),
            self.username.clone().unwrap_or_else(|| "root".to_string()),
            "-H".to_string(),
            "-S".to_string(),
            "-p".to_string(),
            SUDO_PROMPT.to_string(),
            "--".to_string(),
        ]);
        argv.extend(inner.iter().cloned());
        argv
    }

    fn is_password_prompt(&self, output: &[u8]) -> bool {
        last_line(output).starts_with(SUDO_PROMPT.trim_end())
    }
}

/// Become another user with su
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Su {
    pub username: Option<String>,
}

impl Transport for Su {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        vec![
            "su".to_string(),
            self.username.clone().unwrap_or_else(|| "root".to_string()),
            "-c".to_string(),
            shell_join(inner),
        ]
    }

    fn is_password_prompt(&self, output: &[u8]) -> bool {
        last_line(output).to_lowercase().ends_with("password:")
    }
}

/// Become another user with doas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doas {
    pub username: Option<String>,
}

impl Transport for Doas {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        let mut argv = vec![
            "doas".to_string(),
            "-u".to_string(),
            self.username.clone().unwrap_or_else(|| "root".to_string()),
            "--".to_string(),
        ];
        argv.extend(inner.iter().cloned());
        argv
    }

    fn is_password_prompt(&self, output: &[u8]) -> bool {
        let tail = last_line(output).to_lowercase();
        tail.starts_with("doas") && tail.ends_with("password:")
    }
}

/// Container engine used by [`Container`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn command(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

/// Run the runtime inside a running container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub runtime: ContainerRuntime,
    pub container: String,
    pub username: Option<String>,
}

impl Transport for Container {
    fn build_argv(&self, inner: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.runtime.command().to_string(),
            "exec".to_string(),
            "-i".to_string(),
        ];
        if let Some(user) = &self.username {
            argv.extend(["-u".to_string(), user.clone()]);
        }
        argv.push(self.container.clone());
        argv.extend(inner.iter().cloned());
        argv
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Selected transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Method {
    #[default]
    Local,
    Ssh(Ssh),
    Sudo(Sudo),
    Su(Su),
    Doas(Doas),
    Container(Container),
}

impl Method {
    pub fn transport(&self) -> &dyn Transport {
        match self {
            Method::Local => &Local,
            Method::Ssh(t) => t,
            Method::Sudo(t) => t,
            Method::Su(t) => t,
            Method::Doas(t) => t,
            Method::Container(t) => t,
        }
    }

    /// Parse the command-line form
    ///
    /// `local`, `ssh:[user@]host[:port]`, `sudo[:user]`, `su[:user]`,
    /// `doas[:user]`, `docker:container`, `podman:container`
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (kind, rest) = match spec.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest).filter(|r| !r.is_empty())),
            None => (spec, None),
        };
        let user = rest.map(str::to_string);

        match kind {
            "local" => Ok(Method::Local),
            "ssh" => {
                let target = rest.ok_or_else(|| "ssh needs a host: ssh:[user@]host".to_string())?;
                let (username, host) = match target.split_once('@') {
                    Some((user, host)) => (Some(user.to_string()), host),
                    None => (None, target),
                };
                let (hostname, port) = match host.rsplit_once(':') {
                    Some((name, port)) => {
                        let port = port
                            .parse::<u16>()
                            .map_err(|_| format!("invalid ssh port: {}", port))?;
                        (name.to_string(), Some(port))
                    }
                    None => (host.to_string(), None),
                };
                if hostname.is_empty() {
                    return Err("ssh needs a host: ssh:[user@]host".to_string());
                }
                Ok(Method::Ssh(Ssh {
                    hostname,
                    username,
                    port,
                    ..Ssh::default()
                }))
            }
            "sudo" => Ok(Method::Sudo(Sudo {
                username: user,
                sudo_path: None,
            })),
            "su" => Ok(Method::Su(Su { username: user })),
            "doas" => Ok(Method::Doas(Doas { username: user })),
            "docker" | "podman" => {
                let container = rest.ok_or_else(|| format!("{} needs a container name", kind))?;
                Ok(Method::Container(Container {
                    runtime: if kind == "docker" {
                        ContainerRuntime::Docker
                    } else {
                        ContainerRuntime::Podman
                    },
                    container: container.to_string(),
                    username: None,
                }))
            }
            other => Err(format!("unknown connection method: {}", other)),
        }
    }
}

/// Quote one word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last non-empty line of `output`, trimmed
fn last_line(output: &[u8]) -> String {
    String::from_utf8_lossy(output)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .to_string()
}
