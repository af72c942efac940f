use super::{ConversationState, LocalNetwork};
use crate::config::Network;
use crate::error::ProtocolError;
use crate::protocol::{ClientFactory, ClientRequest, Conversation, EventStream, Session};
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vigil_lib::events::{
    ConsentEntity, ConsentState, ConversationId, EventId, EventKind, InboxId, StreamEvent, GROUP_NAME_FIELD,
};
use vigil_lib::keys;

/// Protocol client for one library version on a [`LocalNetwork`].
pub struct LocalClientFactory {
    network: LocalNetwork,
    version: String,
}

impl LocalClientFactory {
    pub fn new(network: LocalNetwork, version: impl Into<String>) -> Self {
        Self {
            network,
            version: version.into(),
        }
    }
}

#[async_trait]
impl ClientFactory for LocalClientFactory {
    async fn create_client(&self, request: &ClientRequest) -> Result<Arc<dyn Session>, ProtocolError> {
        if request.network != Network::Local {
            return Err(ProtocolError::Transport(format!(
                "the in-process client cannot reach the {} network",
                request.network
            )));
        }

        let inbox_id = keys::derive_inbox_id(&request.keys.signing_key).map_err(ProtocolError::Auth)?;
        let installation_id = self.network.register_installation(request, &inbox_id).await?;
        debug!(
            "[{}] opened installation {} with client {}",
            request.worker, installation_id, self.version
        );

        Ok(Arc::new(LocalSession {
            network: self.network.clone(),
            inbox_id,
            installation_id,
            terminated: AtomicBool::new(false),
        }))
    }
}

pub struct LocalSession {
    network: LocalNetwork,
    inbox_id: InboxId,
    installation_id: String,
    terminated: AtomicBool,
}

impl LocalSession {
    fn ensure_live(&self) -> Result<(), ProtocolError> {
        if self.terminated.load(Ordering::SeqCst) {
            Err(ProtocolError::Terminated)
        } else {
            Ok(())
        }
    }

    fn handle(&self, id: ConversationId, is_dm: bool) -> Arc<dyn Conversation> {
        Arc::new(LocalConversation {
            network: self.network.clone(),
            id,
            is_dm,
            actor_inbox: self.inbox_id.clone(),
            actor_installation: self.installation_id.clone(),
        })
    }

    async fn create_conversation(
        &self,
        peers: &[InboxId],
        name: String,
        is_dm: bool,
    ) -> Result<Arc<dyn Conversation>, ProtocolError> {
        let id = format!("{:016x}", self.network.next_id());
        let mut members = vec![self.inbox_id.clone()];
        {
            let mut state = self.network.state.write().await;
            for peer in peers {
                if !state.known_inboxes.contains(peer) {
                    return Err(ProtocolError::NotFound(format!("inbox {}", peer)));
                }
                if !members.contains(peer) {
                    members.push(peer.clone());
                }
            }
            state.conversations.insert(
                id.clone(),
                ConversationState {
                    is_dm,
                    name: name.clone(),
                    creator: self.inbox_id.clone(),
                    members: members.clone(),
                },
            );
        }

        let event = StreamEvent::Conversation {
            conversation_id: id.clone(),
            creator_inbox_id: self.inbox_id.clone(),
            name,
            is_dm,
        };
        self.network.deliver(&members, Some(&self.inbox_id), event).await;
        Ok(self.handle(id, is_dm))
    }
}

#[async_trait]
impl Session for LocalSession {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    fn installation_id(&self) -> String {
        self.installation_id.clone()
    }

    async fn new_group(
        &self,
        members: &[InboxId],
        name: Option<String>,
    ) -> Result<Arc<dyn Conversation>, ProtocolError> {
        self.ensure_live()?;
        self.create_conversation(members, name.unwrap_or_default(), false)
            .await
    }

    async fn new_dm(&self, peer: &str) -> Result<Arc<dyn Conversation>, ProtocolError> {
        self.ensure_live()?;
        if peer == self.inbox_id {
            return Err(ProtocolError::NotFound("cannot open a dm with yourself".to_string()));
        }

        let existing = {
            let state = self.network.state.read().await;
            state
                .conversations
                .iter()
                .find(|(_, c)| {
                    c.is_dm && c.members.iter().any(|m| m == peer) && c.members.contains(&self.inbox_id)
                })
                .map(|(id, _)| id.clone())
        };
        match existing {
            Some(id) => Ok(self.handle(id, true)),
            None => {
                self.create_conversation(&[peer.to_string()], String::new(), true)
                    .await
            }
        }
    }

    async fn conversation(&self, id: &str) -> Result<Option<Arc<dyn Conversation>>, ProtocolError> {
        self.ensure_live()?;
        let state = self.network.state.read().await;
        Ok(state
            .conversations
            .get(id)
            .filter(|c| c.members.contains(&self.inbox_id))
            .map(|c| self.handle(id.to_string(), c.is_dm)))
    }

    async fn list_conversations(&self) -> Result<Vec<Arc<dyn Conversation>>, ProtocolError> {
        self.ensure_live()?;
        let state = self.network.state.read().await;
        let mut ids: Vec<(&ConversationId, bool)> = state
            .conversations
            .iter()
            .filter(|(_, c)| c.members.contains(&self.inbox_id))
            .map(|(id, c)| (id, c.is_dm))
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|(id, is_dm)| self.handle(id.clone(), is_dm))
            .collect())
    }

    async fn set_consent(
        &self,
        entity: &str,
        entity_type: ConsentEntity,
        state: ConsentState,
    ) -> Result<(), ProtocolError> {
        self.ensure_live()?;
        self.network
            .state
            .write()
            .await
            .consent
            .insert((self.inbox_id.clone(), entity.to_string(), entity_type), state);

        let mut recipients = vec![self.inbox_id.clone()];
        if entity_type == ConsentEntity::Inbox {
            recipients.push(entity.to_string());
        }
        let event = StreamEvent::Consent {
            initiated_by: self.inbox_id.clone(),
            entity: entity.to_string(),
            entity_type,
            state,
        };
        self.network.deliver(&recipients, None, event).await;
        Ok(())
    }

    async fn consent_state(&self, entity: &str, entity_type: ConsentEntity) -> Result<ConsentState, ProtocolError> {
        self.ensure_live()?;
        let state = self.network.state.read().await;
        Ok(state
            .consent
            .get(&(self.inbox_id.clone(), entity.to_string(), entity_type))
            .copied()
            .unwrap_or(ConsentState::Unknown))
    }

    async fn stream(&self, kind: EventKind) -> Result<EventStream, ProtocolError> {
        self.ensure_live()?;
        self.network.open_stream(&self.installation_id, kind).await
    }

    async fn terminate(&self) -> Result<(), ProtocolError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.network.close_installation(&self.installation_id).await;
        Ok(())
    }
}

/// A conversation as seen by one installation.
pub struct LocalConversation {
    network: LocalNetwork,
    id: ConversationId,
    is_dm: bool,
    actor_inbox: InboxId,
    actor_installation: String,
}

impl LocalConversation {
    /// Runs `update` against the conversation state once the actor is known
    /// to be live and a member. Returns the member list after the update.
    async fn mutate<R>(
        &self,
        update: impl FnOnce(&mut ConversationState, &std::collections::HashSet<InboxId>) -> Result<R, ProtocolError>,
    ) -> Result<(R, Vec<InboxId>), ProtocolError> {
        let mut guard = self.network.state.write().await;
        let state = &mut *guard;
        if !state.installations.contains_key(&self.actor_installation) {
            return Err(ProtocolError::Terminated);
        }
        let conversation = state
            .conversations
            .get_mut(&self.id)
            .filter(|c| c.members.contains(&self.actor_inbox))
            .ok_or_else(|| ProtocolError::NotFound(format!("conversation {}", self.id)))?;

        let result = update(conversation, &state.known_inboxes)?;
        Ok((result, conversation.members.clone()))
    }
}

#[async_trait]
impl Conversation for LocalConversation {
    fn id(&self) -> ConversationId {
        self.id.clone()
    }

    fn is_dm(&self) -> bool {
        self.is_dm
    }

    async fn send(&self, content: &str) -> Result<EventId, ProtocolError> {
        let (_, members) = self.mutate(|_, _| Ok(())).await?;
        let id = self.network.next_id();

        let event = StreamEvent::Message {
            id,
            conversation_id: self.id.clone(),
            sender_inbox_id: self.actor_inbox.clone(),
            content: content.to_string(),
        };
        self.network.deliver(&members, Some(&self.actor_inbox), event).await;
        Ok(id)
    }

    async fn update_name(&self, name: &str) -> Result<(), ProtocolError> {
        let (_, members) = self
            .mutate(|conversation, _| {
                conversation.name = name.to_string();
                Ok(())
            })
            .await?;

        let event = StreamEvent::MetadataUpdate {
            conversation_id: self.id.clone(),
            initiated_by: self.actor_inbox.clone(),
            field: GROUP_NAME_FIELD.to_string(),
            new_value: name.to_string(),
        };
        self.network.deliver(&members, Some(&self.actor_inbox), event).await;
        Ok(())
    }

    async fn add_members(&self, inbox_ids: &[InboxId]) -> Result<(), ProtocolError> {
        let ((added, name, creator), members) = self
            .mutate(|conversation, known| {
                if conversation.is_dm {
                    return Err(ProtocolError::NotFound("members of a dm are fixed".to_string()));
                }
                let mut added: Vec<InboxId> = Vec::new();
                for inbox_id in inbox_ids {
                    if !known.contains(inbox_id) {
                        return Err(ProtocolError::NotFound(format!("inbox {}", inbox_id)));
                    }
                    if !conversation.members.contains(inbox_id) && !added.contains(inbox_id) {
                        added.push(inbox_id.clone());
                    }
                }
                conversation.members.extend(added.iter().cloned());
                Ok((added, conversation.name.clone(), conversation.creator.clone()))
            })
            .await?;
        if added.is_empty() {
            return Ok(());
        }

        let event = StreamEvent::MembersAdded {
            conversation_id: self.id.clone(),
            initiated_by: self.actor_inbox.clone(),
            inbox_ids: added.clone(),
        };
        self.network.deliver(&members, Some(&self.actor_inbox), event).await;

        let welcome = StreamEvent::Conversation {
            conversation_id: self.id.clone(),
            creator_inbox_id: creator,
            name,
            is_dm: false,
        };
        self.network.deliver(&added, Some(&self.actor_inbox), welcome).await;
        Ok(())
    }

    async fn remove_members(&self, inbox_ids: &[InboxId]) -> Result<(), ProtocolError> {
        let (removed, _) = self
            .mutate(|conversation, _| {
                if conversation.is_dm {
                    return Err(ProtocolError::NotFound("members of a dm are fixed".to_string()));
                }
                let removed: Vec<InboxId> = conversation
                    .members
                    .iter()
                    .filter(|m| inbox_ids.contains(*m) && **m != self.actor_inbox)
                    .cloned()
                    .collect();
                Ok(removed)
            })
            .await?;
        if removed.is_empty() {
            return Ok(());
        }

        // Removed members still hear about their own removal
        let (_, recipients) = self.mutate(|_, _| Ok(())).await?;
        let event = StreamEvent::MembersRemoved {
            conversation_id: self.id.clone(),
            initiated_by: self.actor_inbox.clone(),
            inbox_ids: removed.clone(),
        };
        self.network.deliver(&recipients, Some(&self.actor_inbox), event).await;

        self.mutate(|conversation, _| {
            conversation.members.retain(|m| !removed.contains(m));
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<InboxId>, ProtocolError> {
        let (_, members) = self.mutate(|_, _| Ok(())).await?;
        Ok(members)
    }
}
