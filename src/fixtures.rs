//! In-memory stand-ins for a cluster of database servers.
//!
//! Each `FakeServer` understands just enough of the bootstrap statements to track the catalog
//! state that matters: databases, roles, extensions, registered nodes and subscriptions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::bootstrap::{Context, LOCAL_HOST};
use crate::config::Config;
use crate::database::{ConnectionDescriptor, Connector, Gateway, Session};
use crate::error::DbError;
use crate::spec::{Cluster, ClusterSpec, NodeDescriptor, RoleClass, UserDescriptor};

pub const INIT_DATABASE: &str = "init";
pub const INIT_USERNAME: &str = "init";
pub const INIT_PASSWORD: &str = "initpw";
pub const DATABASE: &str = "defaultdb";
pub const ADMIN_PASSWORD: &str = "adminpw";
pub const INTERNAL_PASSWORD: &str = "pgedgepw";

lazy_static! {
    static ref NAMED_ARG_RE: Regex = Regex::new(r"(\w+) := '((?:[^']|'')*)'").expect("failed to compile NAMED_ARG_RE regex");
    static ref PASSWORD_RE: Regex = Regex::new(r"PASSWORD '((?:[^']|'')*)'").expect("failed to compile PASSWORD_RE regex");
    static ref WHERE_LITERAL_RE: Regex = Regex::new(r"= '((?:[^']|'')*)'").expect("failed to compile WHERE_LITERAL_RE regex");
}

/// A role known to a fake server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeRole {
    pub login: bool,
    pub password: Option<String>,
}

/// The catalog state of one fake server.
#[derive(Clone, Debug, Default)]
pub struct FakeServer {
    pub databases: BTreeSet<String>,
    pub roles: BTreeMap<String, FakeRole>,
    pub extensions: BTreeSet<String>,
    pub nodes: Vec<String>,
    /// Subscriptions by name, mapped to their provider DSN.
    pub subscriptions: BTreeMap<String, String>,
    pub statements: Vec<String>,
    /// The number of upcoming connection attempts to refuse, as if the server were starting.
    pub refuse_connections: usize,
}

impl FakeServer {
    /// A freshly provisioned server, as found in the runtime image.
    pub fn new() -> Self {
        let mut server = Self::default();
        server.databases.insert("postgres".into());
        server.databases.insert(INIT_DATABASE.into());
        server.roles.insert(
            INIT_USERNAME.into(),
            FakeRole {
                login: true,
                password: Some(INIT_PASSWORD.into()),
            },
        );
        server.roles.insert("pgedge".into(), FakeRole::default());
        server
    }

    fn connect(&mut self, target: &ConnectionDescriptor) -> Result<(), DbError> {
        if self.refuse_connections > 0 {
            self.refuse_connections -= 1;
            return Err(DbError::from_sqlstate("57P03", "the database system is starting up"));
        }
        let role = match self.roles.get(&target.user) {
            Some(role) if role.login => role,
            Some(_) => return Err(DbError::from_sqlstate("28000", format!("role \"{}\" is not permitted to log in", target.user))),
            None => return Err(DbError::from_sqlstate("28000", format!("role \"{}\" does not exist", target.user))),
        };
        if let Some(password) = &target.password {
            if role.password.as_ref() != Some(password) {
                return Err(DbError::from_sqlstate("28P01", format!("password authentication failed for user \"{}\"", target.user)));
            }
        }
        if !self.databases.contains(&target.dbname) {
            return Err(DbError::from_sqlstate("3D000", format!("database \"{}\" does not exist", target.dbname)));
        }
        Ok(())
    }

    fn execute(&mut self, stmt: &str) -> Result<(), DbError> {
        self.statements.push(stmt.to_string());
        let words: Vec<&str> = stmt.trim_end_matches(';').split_whitespace().collect();
        match words.as_slice() {
            ["CREATE", "ROLE" | "USER", name, ..] => {
                if self.roles.contains_key(*name) {
                    return Err(DbError::from_sqlstate("42710", format!("role \"{}\" already exists", name)));
                }
                let role = FakeRole {
                    login: words.contains(&"LOGIN"),
                    password: capture(&PASSWORD_RE, stmt),
                };
                self.roles.insert(name.to_string(), role);
            }
            ["ALTER", "USER", name, ..] => {
                let role = self
                    .roles
                    .get_mut(*name)
                    .ok_or_else(|| DbError::from_sqlstate("42704", format!("role \"{}\" does not exist", name)))?;
                role.login = words.contains(&"LOGIN");
                if let Some(password) = capture(&PASSWORD_RE, stmt) {
                    role.password = Some(password);
                }
            }
            ["CREATE", "DATABASE", name, ..] => {
                if !self.databases.insert(name.to_string()) {
                    return Err(DbError::from_sqlstate("42P04", format!("database \"{}\" already exists", name)));
                }
            }
            ["DROP", "DATABASE", name] => {
                if !self.databases.remove(*name) {
                    return Err(DbError::from_sqlstate("3D000", format!("database \"{}\" does not exist", name)));
                }
            }
            ["DROP", "USER", name] => {
                if self.roles.remove(*name).is_none() {
                    return Err(DbError::from_sqlstate("42704", format!("role \"{}\" does not exist", name)));
                }
            }
            ["CREATE", "EXTENSION", "IF", "NOT", "EXISTS", name] => {
                self.extensions.insert(name.to_string());
            }
            ["SELECT", call, ..] if call.starts_with("spock.") => self.spock_call(call, stmt)?,
            _ => (),
        }
        Ok(())
    }

    fn spock_call(&mut self, call: &str, stmt: &str) -> Result<(), DbError> {
        if !self.extensions.contains("spock") {
            return Err(DbError::from_sqlstate("3F000", "schema \"spock\" does not exist"));
        }
        let args: BTreeMap<String, String> = NAMED_ARG_RE
            .captures_iter(stmt)
            .map(|cap| (cap[1].to_string(), cap[2].replace("''", "'")))
            .collect();
        let arg = |name: &str| args.get(name).cloned().unwrap_or_default();
        if call.starts_with("spock.node_create(") {
            let name = arg("node_name");
            if self.nodes.contains(&name) {
                if stmt.contains("NOT IN (SELECT node_name FROM spock.node)") {
                    return Ok(());
                }
                return Err(DbError::from_sqlstate("23505", format!("node {} already exists", name)));
            }
            self.nodes.push(name);
        } else if call.starts_with("spock.sub_create(") {
            let name = arg("subscription_name");
            if self.subscriptions.contains_key(&name) {
                return Err(DbError::from_sqlstate("42710", format!("subscription {} already exists", name)));
            }
            self.subscriptions.insert(name, arg("provider_dsn"));
        } else if call.starts_with("spock.sub_drop(") {
            self.subscriptions.remove(&arg("subscription_name"));
        }
        Ok(())
    }

    fn query_count(&mut self, query: &str) -> Result<i64, DbError> {
        self.statements.push(query.to_string());
        let literal = capture(&WHERE_LITERAL_RE, query).unwrap_or_default();
        let count = if query.contains("FROM spock.") && !self.extensions.contains("spock") {
            return Err(DbError::from_sqlstate("42P01", "relation does not exist"));
        } else if query.contains("FROM spock.node") {
            self.nodes.len()
        } else if query.contains("FROM spock.subscription") {
            usize::from(self.subscriptions.contains_key(&literal))
        } else if query.contains("FROM pg_roles") {
            usize::from(self.roles.contains_key(&literal))
        } else if query.contains("FROM pg_database") {
            usize::from(self.databases.contains(&literal))
        } else {
            return Err(DbError::from_sqlstate("42601", format!("unsupported query {}", query)));
        };
        Ok(count as i64)
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|cap| cap[1].replace("''", "'"))
}

/// A set of fake servers keyed by hostname.
#[derive(Clone, Default)]
pub struct FakeCluster {
    servers: Arc<Mutex<BTreeMap<String, FakeServer>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeCluster {
    /// Create a cluster with a fresh server for each of the given hosts.
    pub fn new<S: AsRef<str>>(hosts: &[S]) -> Self {
        let cluster = Self::default();
        for host in hosts {
            cluster.with_server(host.as_ref(), |_| ());
        }
        cluster
    }

    /// Access the server of the given host, creating a fresh one if needed.
    pub fn with_server<R>(&self, host: &str, f: impl FnOnce(&mut FakeServer) -> R) -> R {
        let mut servers = self.servers.lock().expect("fake cluster lock poisoned");
        f(servers.entry(host.to_string()).or_insert_with(FakeServer::new))
    }

    /// A copy of the state of the server of the given host.
    pub fn server(&self, host: &str) -> FakeServer {
        self.with_server(host, |server| server.clone())
    }

    /// The total number of connection attempts made against this cluster.
    pub fn connection_attempts(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// A connector for the node running on the given host.
    pub fn connector(&self, local_host: &str) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            cluster: self.clone(),
            local_host: local_host.to_string(),
        })
    }

    fn resolve<'a>(&self, local_host: &'a str, host: &'a str) -> &'a str {
        if host == LOCAL_HOST {
            local_host
        } else {
            host
        }
    }
}

/// A connector resolving `localhost` to the server of its own node.
pub struct FakeConnector {
    cluster: FakeCluster,
    local_host: String,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError> {
        self.cluster.connections.fetch_add(1, Ordering::SeqCst);
        let host = self.cluster.resolve(&self.local_host, &target.host).to_string();
        let mut servers = self.cluster.servers.lock().expect("fake cluster lock poisoned");
        let server = servers
            .get_mut(&host)
            .ok_or_else(|| DbError::transient(format!("could not translate host name \"{}\" to address", host)))?;
        server.connect(target)?;
        Ok(Box::new(FakeSession {
            cluster: self.cluster.clone(),
            host,
        }))
    }
}

struct FakeSession {
    cluster: FakeCluster,
    host: String,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&self, stmt: &str) -> Result<(), DbError> {
        self.cluster.with_server(&self.host, |server| server.execute(stmt))
    }

    async fn query_count(&self, query: &str) -> Result<i64, DbError> {
        self.cluster.with_server(&self.host, |server| server.query_count(query))
    }
}

/// A connector whose first sessions to one target fail every statement, as if the connection
/// dropped right after it was opened.
pub struct DroppingConnector {
    inner: Arc<FakeConnector>,
    host: String,
    user: String,
    dropped: AtomicUsize,
    connects: AtomicUsize,
}

impl DroppingConnector {
    /// Wrap the given connector, dropping the first `count` sessions to `user@host`.
    pub fn new(inner: Arc<FakeConnector>, host: &str, user: &str, count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            host: host.to_string(),
            user: user.to_string(),
            dropped: AtomicUsize::new(count),
            connects: AtomicUsize::new(0),
        })
    }

    /// The number of connection attempts made to the target.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DroppingConnector {
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError> {
        if target.host == self.host && target.user == self.user {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.dropped.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Ok(Box::new(DroppedSession));
            }
        }
        self.inner.connect(target).await
    }
}

struct DroppedSession;

#[async_trait]
impl Session for DroppedSession {
    async fn execute(&self, _stmt: &str) -> Result<(), DbError> {
        Err(DbError::transient("connection closed"))
    }

    async fn query_count(&self, _query: &str) -> Result<i64, DbError> {
        Err(DbError::transient("connection closed"))
    }
}

/// The hostname of the node of the given name.
pub fn hostname(node: &str) -> String {
    format!("{}.internal", node)
}

/// A spec for a cluster of the given nodes with one admin and one read-only user.
pub fn cluster_spec(nodes: &[&str]) -> ClusterSpec {
    let user = |username: &str, password: &str, class: RoleClass| UserDescriptor {
        username: username.into(),
        password: Some(password.into()),
        service: "postgres".into(),
        class,
        superuser: false,
    };
    ClusterSpec {
        name: Some(DATABASE.into()),
        id: Some("test-cluster".into()),
        nodes: Some(
            nodes
                .iter()
                .map(|name| NodeDescriptor {
                    name: name.to_string(),
                    hostname: Some(hostname(name)),
                    internal_hostname: None,
                    port: None,
                })
                .collect(),
        ),
        users: Some(vec![
            user("pgedge", INTERNAL_PASSWORD, RoleClass::Default),
            user("admin", ADMIN_PASSWORD, RoleClass::Admin),
            user("app_read_only", "readerpw", RoleClass::ApplicationReadOnly),
            UserDescriptor {
                service: "pgcat".into(),
                ..user("pgcat_admin", "poolerpw", RoleClass::Admin)
            },
        ]),
        ..Default::default()
    }
}

/// Build a bootstrap context for the given node of the given fake cluster.
pub fn context(fake: &FakeCluster, spec: &ClusterSpec, node: &str, config: Arc<Config>) -> Result<Context> {
    context_with(fake.connector(&hostname(node)), spec, node, config)
}

/// Build a bootstrap context for the given node, connecting through the given connector.
pub fn context_with(connector: Arc<dyn Connector>, spec: &ClusterSpec, node: &str, config: Arc<Config>) -> Result<Context> {
    let cluster = Arc::new(Cluster::resolve(spec.clone(), node, config.init_password.as_deref())?);
    let gateway = Gateway::new(connector, config.retry_policy(), config.probe_timeout());
    Ok(Context::new(config, cluster, gateway)?)
}
