//! Seams between the harness and a protocol client implementation.
//!
//! A version of the protocol library is represented by a [`ClientFactory`];
//! each worker owns one [`Session`] produced by it.

use crate::config::Network;
use crate::error::ProtocolError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;
use vigil_lib::events::{ConsentEntity, ConsentState, ConversationId, EventId, EventKind, InboxId, StreamEvent};
use vigil_lib::keys::IdentityKeys;
use vigil_lib::WorkerKey;

/// Live event feed for one subscription. Ends when the session closes it;
/// an `Err` item means the transport dropped the stream.
pub type EventStream = BoxStream<'static, Result<StreamEvent, ProtocolError>>;

#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub worker: WorkerKey,
    pub keys: IdentityKeys,
    pub version: String,
    pub binding_version: String,
    pub state_path: PathBuf,
    pub network: Network,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    async fn create_client(&self, request: &ClientRequest) -> Result<Arc<dyn Session>, ProtocolError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    fn inbox_id(&self) -> InboxId;

    fn installation_id(&self) -> String;

    async fn new_group(
        &self,
        members: &[InboxId],
        name: Option<String>,
    ) -> Result<Arc<dyn Conversation>, ProtocolError>;

    /// Returns the existing direct conversation with `peer` if there is one.
    async fn new_dm(&self, peer: &str) -> Result<Arc<dyn Conversation>, ProtocolError>;

    async fn conversation(&self, id: &str) -> Result<Option<Arc<dyn Conversation>>, ProtocolError>;

    async fn list_conversations(&self) -> Result<Vec<Arc<dyn Conversation>>, ProtocolError>;

    async fn set_consent(
        &self,
        entity: &str,
        entity_type: ConsentEntity,
        state: ConsentState,
    ) -> Result<(), ProtocolError>;

    async fn consent_state(&self, entity: &str, entity_type: ConsentEntity) -> Result<ConsentState, ProtocolError>;

    async fn stream(&self, kind: EventKind) -> Result<EventStream, ProtocolError>;

    async fn terminate(&self) -> Result<(), ProtocolError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Conversation: Send + Sync + 'static {
    fn id(&self) -> ConversationId;

    fn is_dm(&self) -> bool;

    async fn send(&self, content: &str) -> Result<EventId, ProtocolError>;

    async fn update_name(&self, name: &str) -> Result<(), ProtocolError>;

    async fn add_members(&self, inbox_ids: &[InboxId]) -> Result<(), ProtocolError>;

    async fn remove_members(&self, inbox_ids: &[InboxId]) -> Result<(), ProtocolError>;

    async fn members(&self) -> Result<Vec<InboxId>, ProtocolError>;
}
