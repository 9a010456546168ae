//! Error types for remote calls, the live channel, configuration and the session slot.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Field-level validation messages returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
	fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
	/// Creates an empty set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds one message for `field`.
	#[must_use]
	pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
		self.fields.entry(field.into()).or_default().push(message.into());
		self
	}

	/// Messages for one field.
	pub fn field(&self, name: &str) -> &[String] {
		self.fields.get(name).map(Vec::as_slice).unwrap_or_default()
	}

	/// Iterates fields in name order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
		self.fields.iter().map(|(name, messages)| (name.as_str(), messages.as_slice()))
	}

	/// Returns true when no field carries a message.
	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	/// Reads `{"field": ["msg", ...]}` or `{"field": "msg"}` shaped objects.
	fn from_json(errors: &serde_json::Map<String, Value>) -> Self {
		let mut out = Self::new();
		for (field, messages) in errors {
			match messages {
				Value::Array(items) => {
					for item in items {
						out = out.with(field.clone(), json_text(item));
					}
				}
				other => out = out.with(field.clone(), json_text(other)),
			}
		}
		out
	}
}

impl fmt::Display for ValidationErrors {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for (field, messages) in self.iter() {
			for message in messages {
				if !first {
					f.write_str("; ")?;
				}
				first = false;
				write!(f, "{field}: {message}")?;
			}
		}
		Ok(())
	}
}

fn json_text(value: &Value) -> String {
	match value {
		Value::String(text) => text.clone(),
		other => other.to_string(),
	}
}

/// Normalized failure of a fetch or mutation against the resource API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
	/// The request never produced a response.
	#[error("network failure: {0}")]
	Network(String),

	/// The server rejected the input.
	#[error("validation failed: {0}")]
	Validation(ValidationErrors),

	/// The server answered with a failure status.
	#[error("server error {status}: {message}")]
	Server {
		/// HTTP status code.
		status: u16,
		/// Message extracted from the response body.
		message: String,
	},
}

impl ApiError {
	/// Shorthand for [`ApiError::Network`].
	pub fn network(message: impl Into<String>) -> Self {
		Self::Network(message.into())
	}

	/// Normalizes a failed HTTP response.
	///
	/// 400 and 422 bodies carrying an `errors` object become [`ApiError::Validation`];
	/// everything else becomes [`ApiError::Server`] with the body `message` (or the raw
	/// body when it has none).
	pub fn from_response(status: u16, body: &Value) -> Self {
		if matches!(status, 400 | 422)
			&& let Some(errors) = body.get("errors").and_then(Value::as_object)
		{
			let validation = ValidationErrors::from_json(errors);
			if !validation.is_empty() {
				return Self::Validation(validation);
			}
		}

		let message = match body.get("message") {
			Some(message) => json_text(message),
			None if body.is_null() => String::new(),
			None => json_text(body),
		};
		Self::Server { status, message }
	}

	/// Returns true for failures worth offering a retry affordance for.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Network(_) => true,
			Self::Validation(_) => false,
			Self::Server { status, .. } => *status >= 500,
		}
	}

	/// Field-level detail when this is a validation failure.
	pub fn validation(&self) -> Option<&ValidationErrors> {
		match self {
			Self::Validation(errors) => Some(errors),
			_ => None,
		}
	}
}

/// Failures of the live push channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
	/// Opening the connection failed.
	#[error("live connect failed: {0}")]
	Connect(String),

	/// An established connection broke.
	#[error("live stream failed: {0}")]
	Stream(String),

	/// An inbound message could not be decoded into a push event.
	#[error("undecodable live event {event:?}: {reason}")]
	Decode {
		/// Wire event name.
		event: String,
		/// Why decoding failed.
		reason: String,
	},
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or shape.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A value parsed but is out of range.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Errors from the process-wide live session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
	/// No factory was installed before first use.
	#[error("live session is not configured")]
	NotConfigured,
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn unprocessable_body_becomes_field_errors() {
		let err = ApiError::from_response(422, &json!({
			"message": "invalid",
			"errors": { "price": ["must be positive"], "name": "required" }
		}));
		let fields = err.validation().expect("validation error");
		assert_eq!(fields.field("price"), ["must be positive".to_string()]);
		assert_eq!(fields.field("name"), ["required".to_string()]);
		assert_eq!(err.to_string(), "validation failed: name: required; price: must be positive");
		assert!(!err.is_retryable());
	}

	#[test]
	fn bad_request_without_errors_is_a_server_failure() {
		let err = ApiError::from_response(400, &json!({ "message": "slug taken" }));
		assert_eq!(
			err,
			ApiError::Server {
				status: 400,
				message: "slug taken".into()
			}
		);
		assert!(!err.is_retryable());
	}

	#[test]
	fn server_failures_are_retryable() {
		assert!(ApiError::from_response(503, &Value::Null).is_retryable());
		assert!(ApiError::network("connection reset").is_retryable());
	}
}
