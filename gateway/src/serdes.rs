//! Small serde helpers shared by every engine's config type, grounded in
//! the teacher's `serdes` module: consistent attribute aliases so every
//! `*Config`/`*Policy` struct gets the same `camelCase` +
//! `deny_unknown_fields` + optional-schema shape without repeating it.

#[cfg(feature = "schema")]
pub use schemars::JsonSchema;

pub use macro_rules_attribute::{apply, attribute_alias};

#[macro_export]
attribute_alias! {
	#[apply(schema_de!)] = #[derive(Debug, Clone, serde::Deserialize)] #[serde(rename_all = "camelCase", deny_unknown_fields)] #[cfg_attr(feature = "schema", derive(JsonSchema))];
	#[apply(schema_ser!)] = #[derive(Debug, Clone, serde::Serialize)] #[serde(rename_all = "camelCase")] #[cfg_attr(feature = "schema", derive(JsonSchema))];
	#[apply(schema!)] = #[derive(Debug, Clone, serde::Deserialize, serde::Serialize)] #[serde(rename_all = "camelCase", deny_unknown_fields)] #[cfg_attr(feature = "schema", derive(JsonSchema))];
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

/// `#[serde(with = "serde_dur")]` for a plain `Duration` field.
pub mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

/// `#[serde(with = "serde_dur_option")]` for an `Option<Duration>` field.
pub mod serde_dur_option {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_option_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			Some(t) => serializer.serialize_str(&t.human_format()),
			None => serializer.serialize_none(),
		}
	}
}
