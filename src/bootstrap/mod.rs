//! Node bootstrap phases.
//!
//! A node moves from a freshly provisioned server to a peered member of the replication mesh in
//! four phases, each of which is safe to repeat:
//!
//! 1. `detect` decides whether there is anything to do at all.
//! 2. `roles::provision` creates roles and the target database, then drops the bootstrap
//!    credentials.
//! 3. `topology::register` installs extensions, applies grants and registers the node.
//! 4. `peers::subscribe` waits on every peer and subscribes to it.
//!
//! There is no coordination between nodes. Each node converges on the same topology because
//! subscription names are derived deterministically from the pair of node names.

mod detect;
mod peers;
mod roles;
mod topology;

use std::sync::Arc;

use crate::config::Config;
use crate::database::{ConnectionDescriptor, Gateway};
use crate::error::AppError;
use crate::spec::{Cluster, NodeDescriptor, DEFAULT_PORT, INTERNAL_USER};
use crate::sql::Ident;
use crate::version::ServerVersion;

pub use detect::{detect, Detection};
pub use peers::subscribe;
pub use roles::provision;
pub use topology::register;

/// The host on which the local server listens.
pub const LOCAL_HOST: &str = "localhost";

/// The transient credentials baked into the runtime image.
#[derive(Clone, Debug)]
pub struct InitCredentials {
    pub dbname: Ident,
    pub username: Ident,
    pub password: Option<String>,
}

/// Everything a bootstrap phase needs to do its work.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub cluster: Arc<Cluster>,
    pub init: InitCredentials,
    pub version: ServerVersion,
    pub gateway: Gateway,
    /// The internal replication identity.
    pub internal: Ident,
}

impl Context {
    /// Create a new instance, validating the parts of the config needed for bootstrapping.
    pub fn new(config: Arc<Config>, cluster: Arc<Cluster>, gateway: Gateway) -> Result<Self, AppError> {
        let version = config.server_version()?;
        let init = InitCredentials {
            dbname: Ident::new(config.init_database.as_deref().ok_or(AppError::MissingEnv("INIT_DATABASE"))?)?,
            username: Ident::new(config.init_username.as_deref().ok_or(AppError::MissingEnv("INIT_USERNAME"))?)?,
            password: config.init_password.clone(),
        };
        Ok(Self {
            config,
            cluster,
            init,
            version,
            gateway,
            internal: Ident::new(INTERNAL_USER)?,
        })
    }

    /// The transient bootstrap connection.
    pub fn bootstrap_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: LOCAL_HOST.into(),
            dbname: self.init.dbname.to_string(),
            user: self.init.username.to_string(),
            password: self.init.password.clone(),
            port: DEFAULT_PORT,
        }
    }

    /// The permanent admin connection.
    pub fn admin_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: LOCAL_HOST.into(),
            dbname: self.cluster.database_name.to_string(),
            user: self.cluster.admin.username.to_string(),
            password: Some(self.cluster.admin.password.clone()),
            port: DEFAULT_PORT,
        }
    }

    /// The internal replication identity's local connection.
    pub fn internal_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: LOCAL_HOST.into(),
            dbname: self.cluster.database_name.to_string(),
            user: self.internal.to_string(),
            password: Some(self.cluster.internal_password.clone()),
            port: DEFAULT_PORT,
        }
    }

    /// The connection a node's peers use to replicate from it.
    ///
    /// Replication traffic authenticates without a password, so none is included.
    pub fn replication_descriptor(&self, node: &NodeDescriptor) -> Result<ConnectionDescriptor, AppError> {
        Ok(ConnectionDescriptor {
            host: node.host()?.to_string(),
            dbname: self.cluster.database_name.to_string(),
            user: self.internal.to_string(),
            password: None,
            port: node.port(),
        })
    }
}
