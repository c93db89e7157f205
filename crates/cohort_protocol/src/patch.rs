#![forbid(unsafe_code)]

//! RFC 6902 JSON Patch over `serde_json::Value`, with RFC 6901 pointers.
//!
//! Patches are applied to a copy of the document; the input is never left
//! half-patched when an operation fails.
//!
//! Known limits:
//! - unknown members of an operation object are ignored; a duplicated member
//!   keeps its last value because operations arrive as parsed `Value`s
//! - `-` only means "append" as the last token of an `add` path; anywhere else it
//!   is an unresolvable index
//! - `test` compares numbers by value through `i64`, `u64` or `f64`, so integers
//!   above 2^53 compared against floats may round

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
	#[error("malformed patch document: {0}")]
	Malformed(String),

	#[error("invalid JSON pointer: {0:?}")]
	InvalidPointer(String),

	#[error("path not found: {0:?}")]
	PathNotFound(String),

	#[error("array index out of bounds at {path:?}: {index}")]
	IndexOutOfBounds {
		path: String,
		index: usize,
	},

	#[error("target of {0:?} is not an object or array")]
	NotAContainer(String),

	#[error("cannot move {from:?} into its own child {path:?}")]
	MoveIntoChild {
		from: String,
		path: String,
	},

	#[error("test failed at {0:?}")]
	TestFailed(String),
}

/// One RFC 6902 operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
	Add { path: String, value: Value },
	Remove { path: String },
	Replace { path: String, value: Value },
	Move { from: String, path: String },
	Copy { from: String, path: String },
	Test { path: String, value: Value },
}

impl PatchOperation {
	fn apply(&self, doc: &mut Value) -> Result<(), PatchError> {
		match self {
			PatchOperation::Add { path, value } => add(doc, path, value.clone()),
			PatchOperation::Remove { path } => remove(doc, path).map(drop),
			PatchOperation::Replace { path, value } => replace(doc, path, value.clone()),
			PatchOperation::Move { from, path } => {
				if from == path {
					return resolve(doc, from).map(drop);
				}
				if path.starts_with(from.as_str()) && path.as_bytes().get(from.len()) == Some(&b'/') {
					return Err(PatchError::MoveIntoChild {
						from: from.clone(),
						path: path.clone(),
					});
				}
				let value = remove(doc, from)?;
				add(doc, path, value)
			}
			PatchOperation::Copy { from, path } => {
				let value = resolve(doc, from)?.clone();
				add(doc, path, value)
			}
			PatchOperation::Test { path, value } => {
				if json_equal(resolve(doc, path)?, value) {
					Ok(())
				} else {
					Err(PatchError::TestFailed(path.clone()))
				}
			}
		}
	}
}

/// An ordered list of operations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<PatchOperation>);

impl Patch {
	/// Parse a patch from JSON. Accepts an array of operations or one operation object.
	pub fn from_value(value: &Value) -> Result<Self, PatchError> {
		match value {
			Value::Array(_) => serde_json::from_value(value.clone()).map_err(|e| PatchError::Malformed(e.to_string())),
			Value::Object(_) => serde_json::from_value::<PatchOperation>(value.clone())
				.map(|op| Self(vec![op]))
				.map_err(|e| PatchError::Malformed(e.to_string())),
			other => Err(PatchError::Malformed(format!("expected array or object, got {other}"))),
		}
	}

	pub fn to_value(&self) -> Value {
		serde_json::to_value(&self.0).unwrap_or(Value::Array(Vec::new()))
	}

	pub fn operations(&self) -> &[PatchOperation] {
		&self.0
	}

	/// Apply to a copy of `doc` and return the patched document.
	pub fn apply(&self, doc: &Value) -> Result<Value, PatchError> {
		let mut candidate = doc.clone();
		for op in &self.0 {
			op.apply(&mut candidate)?;
		}
		Ok(candidate)
	}

	/// Apply in place; `doc` is unchanged if any operation fails.
	pub fn apply_in_place(&self, doc: &mut Value) -> Result<(), PatchError> {
		*doc = self.apply(doc)?;
		Ok(())
	}
}

/// Equality for `test`: numbers compare by value, so `1` equals `1.0`.
fn json_equal(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => {
			if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
				x == y
			} else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
				x == y
			} else {
				x.as_f64().zip(y.as_f64()).is_some_and(|(x, y)| x == y)
			}
		}
		(Value::Array(xs), Value::Array(ys)) => xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y)),
		(Value::Object(xs), Value::Object(ys)) => {
			xs.len() == ys.len() && xs.iter().all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
		}
		_ => a == b,
	}
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchError> {
	if pointer.is_empty() {
		return Ok(Vec::new());
	}
	let Some(rest) = pointer.strip_prefix('/') else {
		return Err(PatchError::InvalidPointer(pointer.to_string()));
	};

	rest.split('/')
		.map(|token| unescape_token(token).ok_or_else(|| PatchError::InvalidPointer(pointer.to_string())))
		.collect()
}

fn unescape_token(token: &str) -> Option<String> {
	let mut out = String::with_capacity(token.len());
	let mut chars = token.chars();
	while let Some(c) = chars.next() {
		if c == '~' {
			match chars.next() {
				Some('0') => out.push('~'),
				Some('1') => out.push('/'),
				_ => return None,
			}
		} else {
			out.push(c);
		}
	}
	Some(out)
}

/// Parse an array index token; leading zeros and signs are rejected.
fn parse_index(token: &str) -> Option<usize> {
	if token.is_empty() || (token.len() > 1 && token.starts_with('0')) || !token.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	token.parse().ok()
}

fn resolve<'a>(doc: &'a Value, pointer: &str) -> Result<&'a Value, PatchError> {
	let mut current = doc;
	for token in parse_pointer(pointer)? {
		current = match current {
			Value::Object(map) => map.get(&token),
			Value::Array(items) => parse_index(&token).and_then(|i| items.get(i)),
			_ => None,
		}
		.ok_or_else(|| PatchError::PathNotFound(pointer.to_string()))?;
	}
	Ok(current)
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String], pointer: &str) -> Result<&'a mut Value, PatchError> {
	let mut current = doc;
	for token in tokens {
		current = match current {
			Value::Object(map) => map.get_mut(token),
			Value::Array(items) => parse_index(token).and_then(move |i| items.get_mut(i)),
			_ => None,
		}
		.ok_or_else(|| PatchError::PathNotFound(pointer.to_string()))?;
	}
	Ok(current)
}

/// Split a non-root pointer into its parent container and final token.
fn parent_of<'a>(doc: &'a mut Value, pointer: &str) -> Result<(&'a mut Value, String), PatchError> {
	let mut tokens = parse_pointer(pointer)?;
	let last = tokens.pop().ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
	let parent = resolve_mut(doc, &tokens, pointer)?;
	Ok((parent, last))
}

fn add(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
	if pointer.is_empty() {
		*doc = value;
		return Ok(());
	}

	let (parent, last) = parent_of(doc, pointer)?;

	match parent {
		Value::Object(map) => {
			map.insert(last, value);
			Ok(())
		}
		Value::Array(items) => {
			if last == "-" {
				items.push(value);
				return Ok(());
			}
			let index = parse_index(&last).ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
			if index > items.len() {
				return Err(PatchError::IndexOutOfBounds {
					path: pointer.to_string(),
					index,
				});
			}
			items.insert(index, value);
			Ok(())
		}
		_ => Err(PatchError::NotAContainer(pointer.to_string())),
	}
}

fn remove(doc: &mut Value, pointer: &str) -> Result<Value, PatchError> {
	let (parent, last) = parent_of(doc, pointer)?;

	match parent {
		Value::Object(map) => map.remove(&last).ok_or_else(|| PatchError::PathNotFound(pointer.to_string())),
		Value::Array(items) => {
			let index = parse_index(&last).ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
			if index >= items.len() {
				return Err(PatchError::IndexOutOfBounds {
					path: pointer.to_string(),
					index,
				});
			}
			Ok(items.remove(index))
		}
		_ => Err(PatchError::NotAContainer(pointer.to_string())),
	}
}

fn replace(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
	let tokens = parse_pointer(pointer)?;
	let target = resolve_mut(doc, &tokens, pointer)?;
	*target = value;
	Ok(())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn patch(v: Value) -> Patch {
		Patch::from_value(&v).expect("valid patch")
	}

	#[test]
	fn add_replace_remove_on_objects() {
		let doc = json!({"a": 1});
		let out = patch(json!([
			{"op": "add", "path": "/b", "value": {"c": [1, 2]}},
			{"op": "replace", "path": "/a", "value": "x"},
			{"op": "remove", "path": "/b/c/0"}
		]))
		.apply(&doc)
		.unwrap();
		assert_eq!(out, json!({"a": "x", "b": {"c": [2]}}));
	}

	#[test]
	fn array_append_and_insert() {
		let doc = json!({"xs": [1, 3]});
		let out = patch(json!([
			{"op": "add", "path": "/xs/1", "value": 2},
			{"op": "add", "path": "/xs/-", "value": 4}
		]))
		.apply(&doc)
		.unwrap();
		assert_eq!(out, json!({"xs": [1, 2, 3, 4]}));
	}

	#[test]
	fn add_at_root_replaces_document() {
		let out = patch(json!({"op": "add", "path": "", "value": {"fresh": true}}))
			.apply(&Value::Null)
			.unwrap();
		assert_eq!(out, json!({"fresh": true}));
	}

	#[test]
	fn move_copy_and_test() {
		let doc = json!({"a": {"b": 1}, "c": []});
		let out = patch(json!([
			{"op": "test", "path": "/a/b", "value": 1},
			{"op": "test", "path": "/a/b", "value": 1.0},
			{"op": "test", "path": "/a", "value": {"b": 1.0}},
			{"op": "copy", "from": "/a/b", "path": "/c/-"},
			{"op": "move", "from": "/a", "path": "/d"}
		]))
		.apply(&doc)
		.unwrap();
		assert_eq!(out, json!({"c": [1], "d": {"b": 1}}));
	}

	#[test]
	fn test_compares_numbers_by_value_only() {
		let doc = json!({"n": 1, "xs": [2.5, -3], "s": "1"});
		for (path, value) in [
			("/n", json!(1.0)),
			("/xs", json!([2.5, -3.0])),
			("/xs/1", json!(-3)),
		] {
			let op = patch(json!({"op": "test", "path": path, "value": value}));
			assert!(op.apply(&doc).is_ok(), "{path} should equal {value}");
		}
		for (path, value) in [
			("/n", json!(1.5)),
			("/n", json!("1")),
			("/s", json!(1)),
			("/xs", json!([2.5])),
			("/xs", json!({"0": 2.5, "1": -3})),
		] {
			let op = patch(json!({"op": "test", "path": path, "value": value}));
			assert_eq!(op.apply(&doc), Err(PatchError::TestFailed(path.into())), "{path} vs {value}");
		}
	}

	#[test]
	fn escaped_pointer_tokens() {
		let doc = json!({"a/b": {"~k": 0}});
		let out = patch(json!({"op": "replace", "path": "/a~1b/~0k", "value": 9}))
			.apply(&doc)
			.unwrap();
		assert_eq!(out, json!({"a/b": {"~k": 9}}));
	}

	#[test]
	fn failed_operation_leaves_document_untouched() {
		let mut doc = json!({"a": 1});
		let err = patch(json!([
			{"op": "add", "path": "/b", "value": 2},
			{"op": "test", "path": "/a", "value": 2}
		]))
		.apply_in_place(&mut doc)
		.unwrap_err();
		assert_eq!(err, PatchError::TestFailed("/a".into()));
		assert_eq!(doc, json!({"a": 1}));
	}

	#[test]
	fn rejects_bad_paths() {
		let doc = json!({"xs": [1]});
		assert!(matches!(
			patch(json!({"op": "remove", "path": "/missing"})).apply(&doc),
			Err(PatchError::PathNotFound(_))
		));
		assert!(matches!(
			patch(json!({"op": "add", "path": "/xs/5", "value": 0})).apply(&doc),
			Err(PatchError::IndexOutOfBounds { index: 5, .. })
		));
		assert!(matches!(
			patch(json!({"op": "add", "path": "/xs/01", "value": 0})).apply(&doc),
			Err(PatchError::InvalidPointer(_))
		));
		assert!(matches!(
			patch(json!({"op": "replace", "path": "xs", "value": 0})).apply(&doc),
			Err(PatchError::InvalidPointer(_))
		));
		assert!(matches!(
			patch(json!({"op": "move", "from": "/xs", "path": "/xs/0"})).apply(&doc),
			Err(PatchError::MoveIntoChild { .. })
		));
	}

	#[test]
	fn malformed_documents_are_rejected() {
		assert!(Patch::from_value(&json!("nope")).is_err());
		assert!(Patch::from_value(&json!({"op": "frobnicate", "path": "/a"})).is_err());
		assert!(Patch::from_value(&json!([{"op": "add", "path": "/a"}])).is_err());
	}
}
