//! Reproduces one recorded client's view of a host log.
//!
//! A host log interleaves traffic for every client that was connected. The
//! simulator picks one client from the `connected-clients` listings, bounds
//! the replay to the span during which that client was listed and keeps only
//! the messages the host would have delivered to it.

use std::collections::HashSet;

use serde_json::json;
use tracing::debug;

use tether_config::ReplayClient;
use tether_wire::{Command, ConnectedClients, Data};

use super::{ReplayError, TRANSPORT_TARGET};
use crate::session::{CONNECTED_CLIENTS, SESSION_MANAGER};

/// Filters and rewrites recorded device data for one client.
#[derive(Debug, Clone)]
pub struct ClientSimulator {
    client_id: String,
    start: f64,
    end: Option<f64>,
    tags: HashSet<String>,
}

impl ClientSimulator {
    /// Locates the client's session in `records` and collects the tags of
    /// the `commands` it issued. Commands without an origin are treated as
    /// coming from the simulated client.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::ClientNotFound`] when no listing names a
    /// suitable client.
    pub fn new(
        selection: &ReplayClient,
        records: &[Data],
        commands: &[Command],
    ) -> Result<Self, ReplayError> {
        let (client_id, start) = find_session_start(selection, records).ok_or_else(|| {
            ReplayError::ClientNotFound {
                client: match selection {
                    ReplayClient::Select => None,
                    ReplayClient::Uid(uid) => Some(uid.clone()),
                },
            }
        })?;
        let end = records
            .iter()
            .filter_map(|record| Some((record, client_listing(record)?)))
            .find(|(record, listing)| {
                timestamp(record) > start
                    && !listing.clients.iter().any(|client| client.uid == client_id)
            })
            .map(|(record, _)| timestamp(record));
        let tags = commands
            .iter()
            .filter(|command| {
                command
                    .origin_client()
                    .is_none_or(|origin| origin == client_id)
            })
            .filter_map(|command| command.tag.clone())
            .collect();
        debug!(
            target: TRANSPORT_TARGET,
            client = %client_id,
            start,
            ?end,
            "simulating recorded client"
        );
        Ok(Self {
            client_id,
            start,
            end,
            tags,
        })
    }

    /// Identifier of the simulated client.
    #[must_use]
    pub const fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    /// Returns the record as the simulated client would have received it,
    /// or `None` when the host did not deliver it to that client.
    #[must_use]
    pub fn transform(&self, record: &Data) -> Option<Data> {
        if record.inhibits_frame_send() {
            return None;
        }
        let mut data = record.clone();
        let mut addressed = false;
        let routes = record.send_to_clients();
        if !routes.is_empty() {
            let route = routes.into_iter().find(|route| route.uid == self.client_id)?;
            data.tag = Some(route.tag).filter(|tag| !tag.is_empty());
            data.payload.remove("sendToClients");
            addressed = true;
        }
        if !addressed && let Some(tag) = &data.tag {
            if !self.tags.contains(tag) {
                return None;
            }
            addressed = true;
        }
        if let Some(mut listing) = client_listing(&data) {
            let mut listed = false;
            for client in &mut listing.clients {
                client.is_current = client.uid == self.client_id;
                listed |= client.is_current;
            }
            if !listed {
                return None;
            }
            data.payload
                .insert("connectedClients".to_owned(), json!(listing));
        }
        if !addressed && !self.in_session(&data) {
            return None;
        }
        Some(data)
    }

    fn in_session(&self, data: &Data) -> bool {
        let Some(ts) = data.ts else {
            return true;
        };
        ts >= self.start && self.end.is_none_or(|end| ts <= end)
    }
}

/// Clears `is_current` on every client of a listing so no recorded client
/// is mistaken for this one.
#[must_use]
pub(super) fn without_current_client(record: &Data) -> Data {
    let mut data = record.clone();
    if let Some(mut listing) = client_listing(record) {
        for client in &mut listing.clients {
            client.is_current = false;
        }
        data.payload
            .insert("connectedClients".to_owned(), json!(listing));
    }
    data
}

fn find_session_start(selection: &ReplayClient, records: &[Data]) -> Option<(String, f64)> {
    records.iter().find_map(|record| {
        let listing = client_listing(record)?;
        let chosen = match selection {
            ReplayClient::Select => listing
                .clients
                .iter()
                .find(|client| !client.uid.is_empty() && client.is_current)
                .or_else(|| listing.clients.first())
                .map(|client| client.uid.clone())
                .filter(|uid| !uid.is_empty()),
            ReplayClient::Uid(uid) => listing
                .clients
                .iter()
                .any(|client| client.uid == *uid)
                .then(|| uid.clone()),
        }?;
        Some((chosen, timestamp(record)))
    })
}

/// Decodes a non-empty session-manager client listing.
fn client_listing(record: &Data) -> Option<ConnectedClients> {
    if record.address.kind != SESSION_MANAGER
        || !record.address.name.is_empty()
        || record.data_type != CONNECTED_CLIENTS
    {
        return None;
    }
    record
        .connected_clients()
        .ok()
        .filter(|listing| !listing.clients.is_empty())
}

fn timestamp(record: &Data) -> f64 {
    record.ts.unwrap_or_default()
}
