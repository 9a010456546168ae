//! Push events and the filters subscriptions match them with.

use std::str::FromStr;
use std::time::SystemTime;

use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::LiveError;
use crate::key::{EntityId, ResourceKey, ResourceKind};

/// Kind of server-side change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
	/// An entity was created.
	Created,
	/// An entity was updated.
	Updated,
	/// An entity was deleted.
	Deleted,
	/// An entity's workflow status changed (order fulfilment, notification read state).
	StatusChanged,
}

/// Raw named message as delivered by a [`LiveStream`](super::LiveStream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
	/// Event name, `<resource>.<kind>` (e.g. `order.status-changed`).
	pub event: String,
	/// JSON body carrying at least the entity `id`.
	pub data: String,
}

impl WireMessage {
	/// Creates a wire message.
	pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
		Self {
			event: event.into(),
			data: data.into(),
		}
	}
}

/// Typed server-originated change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
	/// Kind of change.
	pub kind: EventKind,
	/// Resource family concerned.
	pub resource: ResourceKind,
	/// Affected entity.
	pub entity: EntityId,
	/// Full decoded body; opaque to the coordination layer.
	pub payload: Value,
	/// Local arrival time.
	pub received_at: SystemTime,
}

impl PushEvent {
	/// Creates an event stamped with the current time.
	pub fn new(kind: EventKind, resource: ResourceKind, entity: impl Into<EntityId>, payload: Value) -> Self {
		Self {
			kind,
			resource,
			entity: entity.into(),
			payload,
			received_at: SystemTime::now(),
		}
	}

	/// Decodes a wire message.
	pub fn decode(wire: &WireMessage) -> Result<Self, LiveError> {
		let fail = |reason: String| LiveError::Decode {
			event: wire.event.clone(),
			reason,
		};

		let (resource, kind) = wire
			.event
			.split_once('.')
			.ok_or_else(|| fail("expected `<resource>.<kind>`".into()))?;
		let resource = ResourceKind::from_str(resource).map_err(|_| fail(format!("unknown resource `{resource}`")))?;
		let kind = EventKind::from_str(kind).map_err(|_| fail(format!("unknown event kind `{kind}`")))?;

		let payload: Value = serde_json::from_str(&wire.data).map_err(|err| fail(err.to_string()))?;
		let id = payload.get("id").cloned().ok_or_else(|| fail("missing `id`".into()))?;
		let entity: EntityId = serde_json::from_value(id).map_err(|err| fail(err.to_string()))?;

		Ok(Self::new(kind, resource, entity, payload))
	}

	/// Entity key this event concerns.
	pub fn key(&self) -> ResourceKey {
		ResourceKey::entity(self.resource, self.entity.clone())
	}
}

/// Predicate selecting which events a subscription receives.
///
/// Unset fields match everything; [`EventFilter::any`] matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
	kinds: Option<Vec<EventKind>>,
	resource: Option<ResourceKind>,
	entity: Option<EntityId>,
}

impl EventFilter {
	/// Matches every event.
	pub fn any() -> Self {
		Self::default()
	}

	/// Matches events relevant to `key`: the same resource family and, for entity
	/// keys, the same entity. Collection keys match every entity of their family.
	pub fn for_key(key: &ResourceKey) -> Self {
		Self {
			kinds: None,
			resource: Some(key.kind()),
			entity: key.entity_id().cloned(),
		}
	}

	/// Restricts to the given kinds.
	#[must_use]
	pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
		self.kinds = Some(kinds.into_iter().collect());
		self
	}

	/// Restricts to one resource family.
	#[must_use]
	pub fn resource(mut self, resource: ResourceKind) -> Self {
		self.resource = Some(resource);
		self
	}

	/// Restricts to one entity.
	#[must_use]
	pub fn entity(mut self, entity: impl Into<EntityId>) -> Self {
		self.entity = Some(entity.into());
		self
	}

	/// Returns true when `event` passes this filter.
	pub fn matches(&self, event: &PushEvent) -> bool {
		self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&event.kind))
			&& self.resource.is_none_or(|resource| resource == event.resource)
			&& self.entity.as_ref().is_none_or(|entity| *entity == event.entity)
	}
}
