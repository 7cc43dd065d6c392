//! Cluster specification model.
//!
//! The spec file is a JSON document describing the database, its nodes and its users. It is
//! loaded once at startup and resolved into a `Cluster`, which is immutable for the rest of the
//! process's lifetime.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::{AppError, ERR_SPEC_NOT_FOUND};
use crate::sql::Ident;

/// The name of the internal replication identity.
pub const INTERNAL_USER: &str = "pgedge";
/// The service tag of users which belong to the database.
pub const DATABASE_SERVICE: &str = "postgres";
/// The cluster id used when the spec does not provide one.
pub const DEFAULT_CLUSTER_ID: &str = "default";
/// The port used when a node does not declare one.
pub const DEFAULT_PORT: u16 = 5432;

/// The raw cluster spec, as found on disk.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterSpec {
    pub name: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    pub nodes: Option<Vec<NodeDescriptor>>,
    pub users: Option<Vec<UserDescriptor>>,
    #[serde(rename = "self")]
    pub self_node: Option<NodeDescriptor>,
}

/// The operating mode of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Online,
    Offline,
}

/// A member of the replication mesh.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub hostname: Option<String>,
    /// Legacy alternative to `hostname`.
    pub internal_hostname: Option<String>,
    pub port: Option<u16>,
}

impl NodeDescriptor {
    /// The hostname of this node, falling back to the legacy `internal_hostname` field.
    pub fn host(&self) -> Result<&str, AppError> {
        self.hostname
            .as_deref()
            .or(self.internal_hostname.as_deref())
            .ok_or_else(|| AppError::MissingHostname(self.name.clone()))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// A user account, as declared in the spec.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UserDescriptor {
    pub username: String,
    pub password: Option<String>,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "type", default)]
    pub class: RoleClass,
    #[serde(default)]
    pub superuser: bool,
}

/// The class of a user, determining its creation statement and grants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleClass {
    Admin,
    InternalAdmin,
    ApplicationReadOnly,
    InternalReadOnly,
    PoolerAuth,
    #[default]
    #[serde(other)]
    Default,
}

impl RoleClass {
    /// Check if this class only receives read access.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ApplicationReadOnly | Self::InternalReadOnly | Self::PoolerAuth)
    }
}

/// A validated database user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub username: Ident,
    pub password: String,
    pub class: RoleClass,
    pub superuser: bool,
}

/// A resolved and validated cluster description.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub database_name: Ident,
    pub database_id: String,
    pub mode: Mode,
    pub nodes: Vec<NodeDescriptor>,
    pub self_node: NodeDescriptor,
    /// Users to be created, excluding the internal replication identity.
    pub users: Vec<User>,
    /// The admin user, which owns the target database.
    pub admin: User,
    /// The password of the internal replication identity.
    pub internal_password: String,
}

impl ClusterSpec {
    /// Load the spec from the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("{}: {}", ERR_SPEC_NOT_FOUND, path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("error parsing spec {}", path.display()))
    }
}

impl Cluster {
    /// Resolve the given spec into a validated cluster description.
    ///
    /// `node_name` identifies this node when the spec has no explicit `self` entry, and
    /// `init_password` is used for the internal identity when the spec does not declare it.
    pub fn resolve(spec: ClusterSpec, node_name: &str, init_password: Option<&str>) -> Result<Self, AppError> {
        let database_name = match spec.name.as_deref() {
            Some(name) if !name.is_empty() => Ident::new(name)?,
            _ => return Err(AppError::MissingDatabaseName),
        };
        let nodes = match spec.nodes {
            Some(nodes) if !nodes.is_empty() => nodes,
            _ => return Err(AppError::MissingNodes),
        };
        let users = match spec.users {
            Some(users) if !users.is_empty() => users,
            _ => return Err(AppError::MissingUsers),
        };
        for (idx, node) in nodes.iter().enumerate() {
            node.host()?;
            if nodes[..idx].iter().any(|other| other.name == node.name) {
                return Err(AppError::DuplicateNode(node.name.clone()));
            }
        }

        let self_node = match spec.self_node {
            Some(explicit) => {
                explicit.host()?;
                if !nodes.iter().any(|node| node.name == explicit.name) {
                    return Err(AppError::UnknownSelfNode(explicit.name));
                }
                explicit
            }
            None => nodes
                .iter()
                .find(|node| node.name == node_name)
                .cloned()
                .ok_or_else(|| AppError::UnknownSelfNode(node_name.to_string()))?,
        };

        // Only database users are relevant. Later entries for the same username win, and usernames
        // match regardless of case as the server folds them.
        let mut relevant: Vec<UserDescriptor> = Vec::with_capacity(users.len());
        for user in users.into_iter().filter(|user| user.service == DATABASE_SERVICE) {
            match relevant.iter_mut().find(|existing| existing.username.eq_ignore_ascii_case(&user.username)) {
                Some(existing) => *existing = user,
                None => relevant.push(user),
            }
        }

        // The internal identity already exists in the image, so it is never created.
        let internal_password = match relevant.iter().position(|user| user.username.eq_ignore_ascii_case(INTERNAL_USER)) {
            Some(idx) => relevant.remove(idx).password,
            None => None,
        }
        .or_else(|| init_password.map(String::from))
        .filter(|pw| !pw.is_empty())
        .ok_or(AppError::MissingReplicationPassword)?;

        let admin = relevant
            .iter()
            .find(|user| user.class == RoleClass::Admin)
            .filter(|user| !user.username.is_empty() && user.password.as_deref().map_or(false, |pw| !pw.is_empty()))
            .ok_or(AppError::MissingAdminCredentials)?
            .username
            .clone();
        let users = relevant
            .into_iter()
            .map(|user| {
                let password = user.password.ok_or_else(|| AppError::MissingPassword(user.username.clone()))?;
                Ok(User {
                    username: Ident::new(&user.username)?,
                    password,
                    class: user.class,
                    superuser: user.superuser,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;
        let admin = users
            .iter()
            .find(|user| user.username.as_str().eq_ignore_ascii_case(&admin))
            .cloned()
            .ok_or(AppError::MissingAdminCredentials)?;

        Ok(Self {
            database_name,
            database_id: spec.id.unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string()),
            mode: spec.mode,
            nodes,
            self_node,
            users,
            admin,
            internal_password,
        })
    }

    /// All nodes other than this one, in spec order.
    pub fn peers(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(move |node| node.name != self.self_node.name)
    }
}
