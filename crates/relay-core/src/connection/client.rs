use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    connection::state::ClientEvent,
    domain::{ChatAddress, SessionBlob},
    Result,
};

/// Channel on which a client delivers its lifecycle events.
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// A concrete bridge invocation (program + args), built from config.
#[derive(Clone, Debug)]
pub struct BridgeInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Hexagonal port for the messaging-network client.
///
/// The production implementation drives a headless browser bridge as a subprocess; tests
/// use in-memory fakes. Implementations never touch `ConnectionState` directly: they
/// report what happened on the event channel and the connection manager decides.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Start (or restart) the client. With `session`, the client tries to resume instead
    /// of producing a pairing code.
    ///
    /// An `Err` means the client could not be started at all.
    async fn start(&self, session: Option<SessionBlob>, events: EventSender) -> Result<()>;

    /// Send one text message. Resolves once the network accepted or rejected it.
    async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<()>;

    /// Release the client's resources (terminates the subprocess).
    async fn shutdown(&self) -> Result<()>;
}
