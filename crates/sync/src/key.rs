//! Logical keys correlating repeated loads of the same remote resource.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

/// Catalog resource families managed by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
	/// Catalog product.
	Product,
	/// Product category.
	Category,
	/// Customer order.
	Order,
	/// Discount coupon.
	Coupon,
	/// Staff or customer account.
	User,
	/// Contact form submission.
	Contact,
	/// Storefront popup.
	Popup,
	/// Storefront hero image.
	HeroImage,
	/// Inbox notification.
	Notification,
}

impl ResourceKind {
	/// Plural label used for collection keys.
	pub const fn plural(self) -> &'static str {
		match self {
			Self::Product => "products",
			Self::Category => "categories",
			Self::Order => "orders",
			Self::Coupon => "coupons",
			Self::User => "users",
			Self::Contact => "contacts",
			Self::Popup => "popups",
			Self::HeroImage => "hero-images",
			Self::Notification => "notifications",
		}
	}
}

/// Server-assigned entity identifier.
///
/// The API hands out both numeric and string ids; both are kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
	/// Creates an id from its textual form.
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// Returns the textual form.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for EntityId {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

impl From<String> for EntityId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl From<u64> for EntityId {
	fn from(value: u64) -> Self {
		Self(value.to_string())
	}
}

impl<'de> Deserialize<'de> for EntityId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Text(String),
			Number(u64),
		}

		Ok(match Raw::deserialize(deserializer)? {
			Raw::Text(text) => Self(text),
			Raw::Number(number) => Self::from(number),
		})
	}
}

/// Logical key of a load: a resource family plus an optional entity.
///
/// Entity keys address one record (`product:123`); collection keys address a list
/// screen (`orders`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
	kind: ResourceKind,
	entity: Option<EntityId>,
}

impl ResourceKey {
	/// Key for one entity.
	pub fn entity(kind: ResourceKind, id: impl Into<EntityId>) -> Self {
		Self {
			kind,
			entity: Some(id.into()),
		}
	}

	/// Key for a whole collection.
	pub const fn collection(kind: ResourceKind) -> Self {
		Self { kind, entity: None }
	}

	/// Resource family.
	pub const fn kind(&self) -> ResourceKind {
		self.kind
	}

	/// Entity id, `None` for collection keys.
	pub fn entity_id(&self) -> Option<&EntityId> {
		self.entity.as_ref()
	}

	/// Returns true when this key addresses a collection.
	pub const fn is_collection(&self) -> bool {
		self.entity.is_none()
	}
}

impl fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.entity {
			Some(id) => write!(f, "{}:{id}", self.kind),
			None => f.write_str(self.kind.plural()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::str::FromStr;

	use super::*;

	#[test]
	fn keys_render_entity_and_collection_forms() {
		assert_eq!(ResourceKey::entity(ResourceKind::Product, 123u64).to_string(), "product:123");
		assert_eq!(ResourceKey::entity(ResourceKind::HeroImage, "banner").to_string(), "hero-image:banner");
		assert_eq!(ResourceKey::collection(ResourceKind::Order).to_string(), "orders");
	}

	#[test]
	fn entity_ids_accept_numbers_and_strings() {
		let numeric: EntityId = serde_json::from_str("42").unwrap();
		let text: EntityId = serde_json::from_str("\"c-9\"").unwrap();
		assert_eq!(numeric, EntityId::from(42u64));
		assert_eq!(text.as_str(), "c-9");
	}

	#[test]
	fn resource_kind_parses_kebab_case() {
		assert_eq!(ResourceKind::from_str("hero-image").unwrap(), ResourceKind::HeroImage);
		assert!(ResourceKind::from_str("HeroImage").is_err());
	}
}
