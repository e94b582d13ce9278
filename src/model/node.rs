use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Deployment role a node can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Etcd,
    Master,
    Worker,
    Ingress,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Etcd, Role::Master, Role::Worker, Role::Ingress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Etcd => "etcd",
            Role::Master => "master",
            Role::Worker => "worker",
            Role::Ingress => "ingress",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub user: String,
    pub port: u16,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            password: None,
            private_key: None,
        }
    }
}

// Credentials never end up in logs
impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A remote machine taking part in a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub ssh: SshCredentials,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            ssh: SshCredentials::default(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn with_ssh(mut self, ssh: SshCredentials) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}
