//! Building connections: stream creation, handshake and authentication.
use bson::{bson, doc, Document};
use log::debug;

use crate::cancel::CancellationToken;
use crate::connstring::ConnectionString;
use crate::error::Error::ArgumentError;
use crate::error::Result;
use crate::topology::server::ServerId;
use crate::wire_protocol::RequestIds;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{run_command, BinaryConnection, Connection, ConnectionId, ConnectionSettings};

/// Constructs ready-to-use connections for a server.
pub trait ConnectionFactory: Send + Sync {
    /// Opens, handshakes and authenticates a new connection.
    fn create_connection(&self, server_id: &ServerId) -> Result<Box<dyn Connection>>;

    /// The request id sequence shared by every connection from this factory.
    fn request_ids(&self) -> RequestIds;
}

/// Credentials handed to the authentication hook.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// The database the user is defined in.
    pub source: String,
    pub username: String,
    pub password: Option<String>,
    pub mechanism: Option<String>,
}

impl Credential {
    /// The credential named by a connection string, if it has a user. The
    /// user is looked up in `authSource`, else the string's database, else
    /// `admin`.
    pub fn from_connection_string(config: &ConnectionString) -> Result<Option<Credential>> {
        let options = &config.options;
        let username = match config.user {
            Some(ref user) => user.clone(),
            None if options.get("authSource").is_some() || options.get("authMechanism").is_some() => {
                return Err(ArgumentError(String::from(
                    "Authentication options require a username.",
                )))
            }
            None => return Ok(None),
        };

        let source = options
            .get("authSource")
            .cloned()
            .or_else(|| config.database.clone().filter(|db| !db.is_empty()))
            .unwrap_or_else(|| String::from("admin"));

        Ok(Some(Credential {
            source: source,
            username: username,
            password: config.password.clone(),
            mechanism: options.get("authMechanism").cloned(),
        }))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Authenticates a freshly opened connection before it is handed out.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        connection: &mut dyn Connection,
        request_ids: &RequestIds,
        credential: &Credential,
    ) -> Result<()>;
}

/// Creates `BinaryConnection`s over the configured stream connector.
pub struct BinaryConnectionFactory {
    settings: ConnectionSettings,
    request_ids: RequestIds,
    next_local_value: AtomicU64,
    auth: Option<(Credential, Arc<dyn Authenticator>)>,
}

impl BinaryConnectionFactory {
    pub fn new(settings: ConnectionSettings) -> BinaryConnectionFactory {
        BinaryConnectionFactory {
            settings: settings,
            request_ids: RequestIds::new(),
            next_local_value: AtomicU64::new(1),
            auth: None,
        }
    }

    /// Runs `authenticator` with `credential` on every new connection.
    pub fn with_authentication(
        mut self,
        credential: Credential,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<BinaryConnectionFactory> {
        if credential.username.is_empty() {
            return Err(ArgumentError(String::from("A credential requires a username.")));
        }
        self.auth = Some((credential, authenticator));
        Ok(self)
    }

    /// The `isMaster` handshake, carrying client metadata.
    pub fn handshake_command(&self) -> Document {
        let mut client = doc! {
            "driver": {
                "name": crate::DRIVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": ::std::env::consts::OS,
                "architecture": ::std::env::consts::ARCH,
            },
        };

        if let Some(ref app_name) = self.settings.app_name {
            client.insert("application", doc! { "name": app_name.to_owned() });
        }

        doc! {
            "isMaster": 1i32,
            "client": client,
        }
    }
}

impl ConnectionFactory for BinaryConnectionFactory {
    fn create_connection(&self, server_id: &ServerId) -> Result<Box<dyn Connection>> {
        let host = &server_id.endpoint;
        let stream = self.settings.connector.connect(
            &host.host_name,
            host.port,
            Some(self.settings.connect_timeout),
        )?;

        let local_value = self.next_local_value.fetch_add(1, Ordering::SeqCst);
        let id = ConnectionId::new(server_id.clone(), local_value);
        let mut connection = BinaryConnection::new(id, stream, self.settings.socket_timeout);

        run_command(
            &mut connection,
            &self.request_ids,
            "admin",
            self.handshake_command(),
            Some(self.settings.connect_timeout),
            &CancellationToken::none(),
        )?;

        if let Some((ref credential, ref authenticator)) = self.auth {
            authenticator.authenticate(&mut connection, &self.request_ids, credential)?;
        }

        debug!("opened connection {}", connection.id());
        Ok(Box::new(connection))
    }

    fn request_ids(&self) -> RequestIds {
        self.request_ids.clone()
    }
}
