//! Minimal JSON path helpers, grounded in the teacher's `json` module.
//! Used by the mirror engine's field-by-field diff (§4.9) to walk into
//! nested objects/arrays when comparing primary vs mirror bodies.

use serde_json::Value;

pub fn traverse<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
	if path.is_empty() {
		return Some(value);
	}
	path.iter().try_fold(value, |target, token| match target {
		Value::Object(map) => map.get(*token),
		Value::Array(list) => parse_index(token).and_then(|x| list.get(x)),
		_ => None,
	})
}

fn parse_index(s: &str) -> Option<usize> {
	if s.starts_with('+') || (s.starts_with('0') && s.len() != 1) {
		return None;
	}
	s.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn traverses_nested_object() {
		let v: Value = serde_json::json!({"a": {"b": [1, 2, 3]}});
		assert_eq!(traverse(&v, &["a", "b", "1"]), Some(&Value::from(2)));
		assert_eq!(traverse(&v, &["a", "missing"]), None);
	}
}
