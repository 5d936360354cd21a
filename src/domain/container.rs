use std::collections::BTreeMap;
use std::fmt;

/// A container port published on the host. `host: None` lets the runtime
/// pick a free host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host: Option<u16>,
    pub container: u16,
}

impl PortBinding {
    pub fn fixed(host: u16, container: u16) -> Self {
        Self {
            host: Some(host),
            container,
        }
    }

    pub fn dynamic(container: u16) -> Self {
        Self {
            host: None,
            container,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub ports: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
    /// Networks to join, in order. Aliases apply to the first one.
    pub networks: Vec<String>,
    pub network_aliases: Vec<String>,
    pub auto_remove: bool,
    pub cmd: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            hostname: None,
            ports: Vec::new(),
            env: BTreeMap::new(),
            networks: Vec::new(),
            network_aliases: Vec::new(),
            auto_remove: false,
            cmd: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub attachable: bool,
}

impl NetworkSpec {
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: "bridge".into(),
            attachable: true,
        }
    }
}

/// Result of a command executed inside a container: exit code plus the
/// combined standard output and standard error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn contains(&self, marker: &str) -> bool {
        self.output.contains(marker)
    }
}

/// Externally reachable address of a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: String,
}

impl Credentials {
    /// The `user:password@` prefix of a connection URI, empty unless both
    /// parts are set.
    pub fn uri_prefix(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() && !self.password.is_empty() => {
                format!("{user}:{}@", self.password)
            }
            _ => String::new(),
        }
    }
}
