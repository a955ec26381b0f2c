use std::sync::{Arc, Weak};

use im::Vector;
use stash::{Family, Mutation};
use trainer_types::rows::{
    GuestRow, NewGuest, NewRelationship, RelationshipRow, RequestRow, RequestStatus, StatusPatch,
};
use trainer_types::transform::guest_client;
use trainer_types::{Client, ClientOrigin, ClientStatus, build_roster};

use crate::backend::{Backend, BackendError, ChangeEvent, ChangeKind, Filter, Subscription, Table};
use crate::channel::{ChannelManager, ChannelState, ChannelTarget};
use crate::engine::{Engine, Source};
use crate::notify::Notification;
use crate::queries::{self, decode_row, encode_row};
use crate::state::{ListenerKey, Snapshot};
use crate::{SyncContext, SyncError};

pub const ROSTER: Family = Family::new("roster");

/// Confirmed members, pending link requests and guests of one trainer.
pub struct RosterSource<B> {
    backend: Arc<B>,
}

impl<B: Backend> Source for RosterSource<B> {
    type Item = Client;

    const FAMILY: Family = ROSTER;
    const NOUN: &'static str = "clients";

    async fn fetch(&self, owner_id: &str) -> Result<Vec<Client>, BackendError> {
        let backend = self.backend.as_ref();
        let (relationships, requests, guests) = futures::try_join!(
            queries::query_relationships(backend, owner_id),
            queries::query_pending_requests(backend, owner_id),
            queries::query_guests(backend, owner_id),
        )?;

        let mut students: Vec<String> = relationships
            .iter()
            .map(|relationship| relationship.student_id.clone())
            .chain(requests.iter().map(|request| request.student_id.clone()))
            .collect();
        students.sort();
        students.dedup();
        let profiles = queries::query_profiles(backend, &students).await?;

        Ok(build_roster(&relationships, &requests, &profiles, &guests))
    }

    async fn remote_count(&self, owner_id: &str) -> Result<usize, BackendError> {
        let backend = self.backend.as_ref();
        let (members, pending) = futures::try_join!(
            queries::count_relationships(backend, owner_id),
            queries::count_pending_requests(backend, owner_id),
        )?;
        Ok(members + pending)
    }

    fn comparable_count(&self, items: &Vector<Client>) -> usize {
        items.iter().filter(|client| !client.is_guest()).count()
    }

    fn announce(&self, owner_id: &str, event: &ChangeEvent) -> Option<(String, Notification)> {
        if event.kind != ChangeKind::Insert {
            return None;
        }
        match event.table {
            Table::TrainerRequests => {
                let request: RequestRow = decode_row(event.table, event.row.clone())
                    .inspect_err(|e| log::debug!("Ignoring pushed request: {e}"))
                    .ok()?;
                (request.status == RequestStatus::Pending && request.requested_by != owner_id)
                    .then(|| {
                        (
                            Client::request_key(request.id),
                            Notification::info(
                                "New client request",
                                "A student wants to train with you",
                            ),
                        )
                    })
            }
            Table::TrainerStudents => {
                let relationship: RelationshipRow = decode_row(event.table, event.row.clone())
                    .inspect_err(|e| log::debug!("Ignoring pushed relationship: {e}"))
                    .ok()?;
                Some((
                    format!("relationship-{}", relationship.id),
                    Notification::info("New client", "A student joined your roster"),
                ))
            }
            _ => None,
        }
    }
}

pub struct RosterSync<B: Backend> {
    backend: Arc<B>,
    engine: Arc<Engine<RosterSource<B>>>,
    channels: ChannelManager<B>,
}

impl<B: Backend> RosterSync<B> {
    pub fn new(backend: Arc<B>, context: &SyncContext) -> Self {
        let source = RosterSource {
            backend: Arc::clone(&backend),
        };
        Self {
            engine: Engine::new(source, context),
            channels: ChannelManager::new(Arc::clone(&backend), context.config.clone()),
            backend,
        }
    }

    pub fn engine(&self) -> &Arc<Engine<RosterSource<B>>> {
        &self.engine
    }

    pub async fn load(&self, force_refresh: bool) -> Result<Vector<Client>, SyncError> {
        self.engine.load(force_refresh).await
    }

    pub async fn refresh(&self) -> Result<Vector<Client>, SyncError> {
        self.engine.refresh().await
    }

    pub fn refresh_debounced(&self) {
        self.engine.refresh_debounced()
    }

    pub fn snapshot(&self) -> Snapshot<Client> {
        self.engine.snapshot()
    }

    pub fn clients(&self) -> Vector<Client> {
        self.engine.items()
    }

    pub fn register_listener(
        &self,
        listener: impl Fn(&Snapshot<Client>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.engine.register_listener(listener)
    }

    pub fn unregister_listener(&self, key: ListenerKey) -> bool {
        self.engine.unregister_listener(key)
    }

    pub fn requests_channel(&self) -> String {
        format!("trainer-requests:{}", self.engine.owner_id())
    }

    pub fn relationships_channel(&self) -> String {
        format!("trainer-students:{}", self.engine.owner_id())
    }

    /// Listen for new link requests and new confirmed relationships.
    pub fn connect(&self) {
        let owner_id = self.engine.owner_id();
        let target: Weak<dyn ChannelTarget> =
            Arc::downgrade(&self.engine) as Weak<dyn ChannelTarget>;
        self.channels.open(
            Subscription {
                channel: self.requests_channel(),
                table: Table::TrainerRequests,
                filter: Filter::new().eq("trainer_id", owner_id),
            },
            target.clone(),
        );
        self.channels.open(
            Subscription {
                channel: self.relationships_channel(),
                table: Table::TrainerStudents,
                filter: Filter::new().eq("trainer_id", owner_id),
            },
            target,
        );
    }

    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.channels.state(channel)
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.channels.close_all().await;
    }

    fn client(&self, client_id: &str) -> Result<Client, SyncError> {
        self.engine
            .find(&client_id.to_string())
            .ok_or_else(|| SyncError::NotFound {
                kind: "client",
                id: client_id.to_string(),
            })
    }

    fn member(&self, student_id: &str) -> Option<Client> {
        self.engine.items().into_iter().find(|client| {
            client.origin == ClientOrigin::Roster && client.user_id.as_deref() == Some(student_id)
        })
    }

    fn pending(&self, client_id: &str, action: &'static str) -> Result<(Client, i64), SyncError> {
        let client = self.client(client_id)?;
        match client.request_id {
            Some(request_id) if client.origin == ClientOrigin::Request => Ok((client, request_id)),
            _ => Err(SyncError::InvalidAction {
                action,
                client_id: client_id.to_string(),
                reason: "there is no pending request",
            }),
        }
    }

    /// Confirm a request the student sent.
    pub async fn accept_request(&self, client_id: &str) -> Result<Client, SyncError> {
        let result = self.accept_request_inner(client_id).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Request accepted",
                    format!("{} is now your client", client.name),
                )
            },
            "Couldn't accept the request",
        );
        result
    }

    async fn accept_request_inner(&self, client_id: &str) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let (pending, request_id) = self.pending(client_id, "accept")?;
        let owner_id = self.engine.owner_id();
        if pending.requested_by_user(owner_id) {
            return Err(SyncError::InvalidAction {
                action: "accept",
                client_id: client_id.to_string(),
                reason: "requests you sent are answered by the student",
            });
        }
        let Some(student_id) = pending.user_id.clone() else {
            return Err(SyncError::InvalidAction {
                action: "accept",
                client_id: client_id.to_string(),
                reason: "the request has no student",
            });
        };

        if let Some(member) = self.member(&student_id) {
            log::info!("{student_id} is already a client, dropping request {request_id}");
            self.backend
                .delete(Table::TrainerRequests, &Filter::new().eq("id", request_id))
                .await?;
            self.engine.apply(Mutation::Remove(pending.id.clone()))?;
            return Ok(member);
        }

        let row = self
            .backend
            .insert(
                Table::TrainerStudents,
                encode_row(&NewRelationship {
                    trainer_id: owner_id.to_string(),
                    student_id,
                    status: ClientStatus::Active,
                })?,
            )
            .await?;
        let relationship: RelationshipRow = decode_row(Table::TrainerStudents, row)?;
        self.backend
            .delete(Table::TrainerRequests, &Filter::new().eq("id", request_id))
            .await?;

        let confirmed = Client {
            id: Client::member_id(relationship.id),
            relationship_id: Some(relationship.id),
            request_id: None,
            requested_by: None,
            status: relationship.status,
            origin: ClientOrigin::Roster,
            join_date: relationship.created_at,
            ..pending
        };
        self.engine.apply(Mutation::Replace {
            key: client_id.to_string(),
            item: confirmed.clone(),
        })?;
        Ok(confirmed)
    }

    /// Turn down a request the student sent.
    pub async fn reject_request(&self, client_id: &str) -> Result<Client, SyncError> {
        let result = self.reject_request_inner(client_id).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Request rejected",
                    format!("Declined {}", client.name),
                )
            },
            "Couldn't reject the request",
        );
        result
    }

    async fn reject_request_inner(&self, client_id: &str) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let (pending, request_id) = self.pending(client_id, "reject")?;
        if pending.requested_by_user(self.engine.owner_id()) {
            return Err(SyncError::InvalidAction {
                action: "reject",
                client_id: client_id.to_string(),
                reason: "only requests sent by the student can be rejected",
            });
        }

        self.backend
            .update(
                Table::TrainerRequests,
                &Filter::new().eq("id", request_id),
                encode_row(&StatusPatch {
                    status: RequestStatus::Rejected,
                })?,
            )
            .await?;
        self.engine.apply(Mutation::Remove(pending.id.clone()))?;
        Ok(pending)
    }

    /// Withdraw a request the trainer sent.
    pub async fn cancel_request(&self, client_id: &str) -> Result<Client, SyncError> {
        let result = self.cancel_request_inner(client_id).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Request cancelled",
                    format!("Withdrew the request to {}", client.name),
                )
            },
            "Couldn't cancel the request",
        );
        result
    }

    async fn cancel_request_inner(&self, client_id: &str) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let (pending, request_id) = self.pending(client_id, "cancel")?;
        if !pending.requested_by_user(self.engine.owner_id()) {
            return Err(SyncError::InvalidAction {
                action: "cancel",
                client_id: client_id.to_string(),
                reason: "only requests you sent can be cancelled",
            });
        }

        self.backend
            .delete(Table::TrainerRequests, &Filter::new().eq("id", request_id))
            .await?;
        self.engine.apply(Mutation::Remove(pending.id.clone()))?;
        Ok(pending)
    }

    /// Remove any roster entry. Pending entries are cancelled or rejected depending on who
    /// sent the request.
    pub async fn delete_client(&self, client_id: &str) -> Result<Client, SyncError> {
        let result = self.delete_client_inner(client_id).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Client removed",
                    format!("{} is no longer on your roster", client.name),
                )
            },
            "Couldn't remove the client",
        );
        result
    }

    async fn delete_client_inner(&self, client_id: &str) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let client = self.client(client_id)?;
        let (table, row_id) = match (client.origin, client.relationship_id, client.guest_id) {
            (ClientOrigin::Request, _, _) => {
                return if client.requested_by_user(self.engine.owner_id()) {
                    self.cancel_request_inner(client_id).await
                } else {
                    self.reject_request_inner(client_id).await
                };
            }
            (ClientOrigin::Roster, Some(relationship_id), _) => {
                (Table::TrainerStudents, relationship_id)
            }
            (ClientOrigin::Guest, _, Some(guest_id)) => (Table::TrainerGuests, guest_id),
            _ => {
                return Err(SyncError::InvalidAction {
                    action: "delete",
                    client_id: client_id.to_string(),
                    reason: "the entry has no backing row",
                });
            }
        };

        self.backend
            .delete(table, &Filter::new().eq("id", row_id))
            .await?;
        self.engine.apply(Mutation::Remove(client.id.clone()))?;
        Ok(client)
    }

    /// Mark a confirmed member or a guest active or inactive.
    pub async fn update_status(
        &self,
        client_id: &str,
        status: ClientStatus,
    ) -> Result<Client, SyncError> {
        let result = self.update_status_inner(client_id, status).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Status updated",
                    format!("{} is now {}", client.name, client.status.label()),
                )
            },
            "Couldn't update the status",
        );
        result
    }

    async fn update_status_inner(
        &self,
        client_id: &str,
        status: ClientStatus,
    ) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let invalid = |reason| SyncError::InvalidAction {
            action: "update the status of",
            client_id: client_id.to_string(),
            reason,
        };
        if status == ClientStatus::Pending {
            return Err(invalid("status can only be set to active or inactive"));
        }
        let client = self.client(client_id)?;
        if client.is_pending() {
            return Err(invalid("the request has not been answered yet"));
        }
        let (table, row_id) = match (client.origin, client.relationship_id, client.guest_id) {
            (ClientOrigin::Roster, Some(relationship_id), _) => {
                (Table::TrainerStudents, relationship_id)
            }
            (ClientOrigin::Guest, _, Some(guest_id)) => (Table::TrainerGuests, guest_id),
            _ => return Err(invalid("the entry has no backing row")),
        };

        let changed = self
            .backend
            .update(
                table,
                &Filter::new().eq("id", row_id),
                encode_row(&StatusPatch { status })?,
            )
            .await?;
        if changed == 0 {
            return Err(SyncError::NotFound {
                kind: "client",
                id: client_id.to_string(),
            });
        }

        let updated = Client { status, ..client };
        self.engine.apply(Mutation::Update(updated.clone()))?;
        Ok(updated)
    }

    /// Add a client who has no account. Guests are listed after members and requests.
    pub async fn add_guest(
        &self,
        name: &str,
        email: Option<String>,
        plan: Option<String>,
    ) -> Result<Client, SyncError> {
        let result = self.add_guest_inner(name, email, plan).await;
        self.engine.report(
            &result,
            |client| {
                Notification::success(
                    "Guest added",
                    format!("{} was added to your roster", client.name),
                )
            },
            "Couldn't add the guest",
        );
        result
    }

    async fn add_guest_inner(
        &self,
        name: &str,
        email: Option<String>,
        plan: Option<String>,
    ) -> Result<Client, SyncError> {
        self.engine.ensure_alive()?;
        let row = self
            .backend
            .insert(
                Table::TrainerGuests,
                encode_row(&NewGuest {
                    trainer_id: self.engine.owner_id().to_string(),
                    full_name: name.to_string(),
                    email,
                    plan,
                    status: ClientStatus::Active,
                })?,
            )
            .await?;
        let guest: GuestRow = decode_row(Table::TrainerGuests, row)?;
        let client = guest_client(&guest);
        self.engine.apply(Mutation::Add(client.clone()))?;
        Ok(client)
    }
}
