//! # Struct Binding
//!
//! Deserializes the flat merged snapshot into any `serde` type.
//!
//! A struct field named `port` inside a field named `server` reads the key
//! `server.port`; `#[serde(rename = "...")]` picks a different key and may
//! itself contain dots. A field without a value falls back to
//! `#[serde(default)]`, otherwise to its zero value. It is reported as
//! missing only when the field metadata marks its key (or a key below it)
//! as required.
//!
//! Problems do not stop the pass: conversion failures are recorded and the
//! field is bound to its zero value, missing fields are bound to a zero
//! placeholder on a retry, and everything found is returned together.

use crate::metadata::Metadata;
use crate::value::{ConfigMap, Value};
use errors::{ConfigError, ConfigResult};
use serde::de::value::{MapDeserializer, StrDeserializer};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, IntoDeserializer, MapAccess, SeqAccess,
    Visitor
};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Upper bound on retries, one per newly discovered missing field.
const MAX_PASSES: usize = 256;

/// Binds `values` to `T`, reporting every unconvertible key and every
/// required key of `metadata` that had to be zero-filled, at once.
pub fn bind<T: DeserializeOwned>(values: &ConfigMap, metadata: &Metadata) -> ConfigResult<T> {
    let mut placeholders = HashSet::new();

    for _ in 0..MAX_PASSES {
        let (result, conversion_errors) = {
            let ctx = BindContext {
                values,
                placeholders: &placeholders,
                errors: RefCell::new(Vec::new())
            };
            let result = T::deserialize(FlatDeserializer {
                ctx: &ctx,
                prefix: String::new()
            });
            (result, ctx.errors.into_inner())
        };

        match result {
            Ok(bound) => {
                let mut errors = required_missing(metadata, values, &placeholders);
                errors.extend(conversion_errors);
                return match ConfigError::combine(errors) {
                    None => Ok(bound),
                    Some(e) => Err(e)
                };
            }
            Err(BindError::Missing { key, .. }) if !placeholders.contains(&key) => {
                placeholders.insert(key);
            }
            Err(e) => {
                let mut errors = required_missing(metadata, values, &placeholders);
                errors.extend(conversion_errors);
                errors.push(ConfigError::Binding {
                    message: e.to_string()
                });
                return Err(ConfigError::Validation { errors });
            }
        }
    }

    Err(ConfigError::Binding {
        message: "too many missing fields".to_string()
    })
}

/// Required metadata keys that are absent and were zero-filled, directly or
/// through a missing parent section.
fn required_missing(
    metadata: &Metadata,
    values: &ConfigMap,
    placeholders: &HashSet<String>
) -> Vec<ConfigError> {
    let keys: BTreeSet<&String> = metadata
        .fields
        .iter()
        .filter(|(_, field)| field.required)
        .map(|(key, _)| key)
        .filter(|key| matches!(values.get(key.as_str()), None | Some(Value::Null)))
        .filter(|key| {
            placeholders.iter().any(|placeholder| {
                key.as_str() == placeholder
                    || key
                        .strip_prefix(placeholder.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
        })
        .collect();

    keys.into_iter()
        .map(|key| ConfigError::RequiredFieldMissing { key: key.clone() })
        .collect()
}

#[derive(Debug)]
enum BindError {
    Missing { key: String, qualified: bool },
    Message(String)
}

impl BindError {
    fn qualify(self, prefix: &str) -> Self {
        match self {
            BindError::Missing {
                key,
                qualified: false
            } => BindError::Missing {
                key: join(prefix, &key),
                qualified: true
            },
            other => other
        }
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::Missing { key, .. } => write!(f, "missing field '{key}'"),
            BindError::Message(message) => f.write_str(message)
        }
    }
}

impl std::error::Error for BindError {}

impl de::Error for BindError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        BindError::Message(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        BindError::Missing {
            key: field.to_string(),
            qualified: false
        }
    }
}

struct BindContext<'a> {
    values: &'a ConfigMap,
    placeholders: &'a HashSet<String>,
    errors: RefCell<Vec<ConfigError>>
}

impl BindContext<'_> {
    fn conversion_failed(&self, key: &str, value: &Value, target: &str) {
        self.errors.borrow_mut().push(ConfigError::TypeConversion {
            key: key.to_string(),
            value: value.to_string(),
            target: target.to_string()
        });
    }

    fn has_children(&self, prefix: &str) -> bool {
        let nested = format!("{prefix}.");
        self.values.keys().any(|key| key.starts_with(&nested))
    }

    /// Distinct first segments below `prefix` (all top-level segments when empty).
    fn children(&self, prefix: &str) -> BTreeSet<String> {
        let nested = format!("{prefix}.");
        self.values
            .keys()
            .filter_map(|key| {
                if prefix.is_empty() {
                    Some(key.as_str())
                } else {
                    key.strip_prefix(&nested)
                }
            })
            .filter_map(|rest| rest.split('.').next())
            .map(str::to_string)
            .collect()
    }

    fn flat_entry(&self, key: String) -> Entry<'_> {
        match self.values.get(&key) {
            Some(value) => Entry::Value(value, key),
            None => Entry::Flat(key)
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

enum Entry<'a> {
    Value(&'a Value, String),
    Flat(String),
    Zero
}

impl<'a> Entry<'a> {
    fn deserialize<'de, T>(self, ctx: &'a BindContext<'a>, seed: T) -> Result<T::Value, BindError>
    where
        T: DeserializeSeed<'de>
    {
        match self {
            Entry::Value(value, key) => seed.deserialize(ValueDeserializer { ctx, value, key }),
            Entry::Flat(prefix) => seed.deserialize(FlatDeserializer { ctx, prefix }),
            Entry::Zero => seed.deserialize(ZeroDeserializer)
        }
    }
}

/// Key/value pairs handed to a visitor one by one.
struct EntryAccess<'a> {
    ctx: &'a BindContext<'a>,
    entries: std::vec::IntoIter<(String, Entry<'a>)>,
    pending: Option<Entry<'a>>
}

impl<'a> EntryAccess<'a> {
    fn new(ctx: &'a BindContext<'a>, entries: Vec<(String, Entry<'a>)>) -> Self {
        Self {
            ctx,
            entries: entries.into_iter(),
            pending: None
        }
    }
}

impl<'de, 'a> MapAccess<'de> for EntryAccess<'a> {
    type Error = BindError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, BindError>
    where
        K: DeserializeSeed<'de>
    {
        match self.entries.next() {
            Some((name, entry)) => {
                self.pending = Some(entry);
                let key: de::value::StringDeserializer<BindError> = name.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None)
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, BindError>
    where
        V: DeserializeSeed<'de>
    {
        match self.pending.take() {
            Some(entry) => entry.deserialize(self.ctx, seed),
            None => Err(de::Error::custom("value requested before key"))
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Elements handed to a visitor one by one.
struct EntrySeq<'a> {
    ctx: &'a BindContext<'a>,
    entries: std::vec::IntoIter<Entry<'a>>
}

impl<'de, 'a> SeqAccess<'de> for EntrySeq<'a> {
    type Error = BindError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, BindError>
    where
        T: DeserializeSeed<'de>
    {
        match self.entries.next() {
            Some(entry) => entry.deserialize(self.ctx, seed).map(Some),
            None => Ok(None)
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Deserializer rooted at a key prefix of the flat map.
struct FlatDeserializer<'a> {
    ctx: &'a BindContext<'a>,
    prefix: String
}

impl<'a> FlatDeserializer<'a> {
    fn struct_entries(&self, fields: &'static [&'static str]) -> Vec<(String, Entry<'a>)> {
        fields
            .iter()
            .filter_map(|field| {
                let key = join(&self.prefix, field);
                let entry = if let Some(value) = self.ctx.values.get(&key) {
                    Entry::Value(value, key)
                } else if self.ctx.has_children(&key) {
                    Entry::Flat(key)
                } else if self.ctx.placeholders.contains(&key) {
                    Entry::Zero
                } else {
                    return None;
                };
                Some(((*field).to_string(), entry))
            })
            .collect()
    }

    fn child_entries(&self) -> Vec<(String, Entry<'a>)> {
        self.ctx
            .children(&self.prefix)
            .into_iter()
            .map(|child| {
                let key = join(&self.prefix, &child);
                (child, self.ctx.flat_entry(key))
            })
            .collect()
    }
}

impl<'de, 'a> Deserializer<'de> for FlatDeserializer<'a> {
    type Error = BindError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let entries = self.child_entries();
        visitor.visit_map(EntryAccess::new(self.ctx, entries))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V
    ) -> Result<V::Value, BindError> {
        let entries = self.struct_entries(fields);
        visitor
            .visit_map(EntryAccess::new(self.ctx, entries))
            .map_err(|e| e.qualify(&self.prefix))
    }

    /// Indexed keys (`list.0`, `list.1`) read as a sequence in index order.
    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let children = self.ctx.children(&self.prefix);
        let mut indexed = Vec::with_capacity(children.len());
        for child in children {
            match child.parse::<usize>() {
                Ok(index) => indexed.push((index, child)),
                Err(_) => return self.deserialize_map(visitor)
            }
        }
        indexed.sort_by_key(|(index, _)| *index);

        let entries: Vec<Entry<'a>> = indexed
            .into_iter()
            .map(|(_, child)| self.ctx.flat_entry(join(&self.prefix, &child)))
            .collect();
        visitor.visit_seq(EntrySeq {
            ctx: self.ctx,
            entries: entries.into_iter()
        })
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct tuple tuple_struct enum identifier
    }
}

/// Deserializer over one stored value.
struct ValueDeserializer<'a> {
    ctx: &'a BindContext<'a>,
    value: &'a Value,
    key: String
}

macro_rules! deserialize_signed {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
            match self.value.to_i64().and_then(|v| <$ty>::try_from(v).ok()) {
                Some(v) => visitor.$visit(v),
                None => {
                    self.failed(stringify!($ty));
                    visitor.$visit(0)
                }
            }
        }
    };
}

macro_rules! deserialize_unsigned {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
            match self.value.to_u64().and_then(|v| <$ty>::try_from(v).ok()) {
                Some(v) => visitor.$visit(v),
                None => {
                    self.failed(stringify!($ty));
                    visitor.$visit(0)
                }
            }
        }
    };
}

impl<'a> ValueDeserializer<'a> {
    fn failed(&self, target: &str) {
        self.ctx.conversion_failed(&self.key, self.value, target);
    }

    fn elements(&self) -> Option<Vec<Entry<'a>>> {
        match self.value {
            Value::Array(items) => Some(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| Entry::Value(item, format!("{}.{index}", self.key)))
                    .collect()
            ),
            _ => None
        }
    }

    fn duration_parts(&self) -> Option<(u64, u64)> {
        self.value
            .to_duration()
            .map(|d| (d.as_secs(), u64::from(d.subsec_nanos())))
    }
}

impl<'de, 'a> Deserializer<'de> for ValueDeserializer<'a> {
    type Error = BindError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::Int(i) => visitor.visit_i64(*i),
            Value::UInt(u) => visitor.visit_u64(*u),
            Value::Float(f) => visitor.visit_f64(*f),
            Value::String(s) => visitor.visit_str(s),
            Value::Duration(_) | Value::Timestamp(_) => visitor.visit_string(self.value.to_string()),
            Value::Array(_) => self.deserialize_seq(visitor),
            Value::Map(_) => self.deserialize_map(visitor)
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value.to_bool() {
            Some(b) => visitor.visit_bool(b),
            None => {
                self.failed("bool");
                visitor.visit_bool(false)
            }
        }
    }

    deserialize_signed!(deserialize_i8, visit_i8, i8);
    deserialize_signed!(deserialize_i16, visit_i16, i16);
    deserialize_signed!(deserialize_i32, visit_i32, i32);
    deserialize_signed!(deserialize_i64, visit_i64, i64);
    deserialize_unsigned!(deserialize_u8, visit_u8, u8);
    deserialize_unsigned!(deserialize_u16, visit_u16, u16);
    deserialize_unsigned!(deserialize_u32, visit_u32, u32);
    deserialize_unsigned!(deserialize_u64, visit_u64, u64);

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value.to_f64() {
            Some(f) if !f.is_finite() || f.abs() <= f64::from(f32::MAX) => visitor.visit_f32(f as f32),
            _ => {
                self.failed("f32");
                visitor.visit_f32(0.0)
            }
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value.to_f64() {
            Some(f) => visitor.visit_f64(f),
            None => {
                self.failed("f64");
                visitor.visit_f64(0.0)
            }
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let text = self.value.to_string();
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => {
                self.failed("char");
                visitor.visit_char('\0')
            }
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value {
            Value::String(s) => visitor.visit_str(s),
            Value::Null => visitor.visit_str(""),
            other => visitor.visit_string(other.to_string())
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_byte_buf(self.value.to_string().into_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_newtype_struct(self)
    }

    /// Arrays bind element-wise; a string binds as a comma-separated list.
    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let ctx = self.ctx;
        if let Some(entries) = self.elements() {
            return visitor.visit_seq(EntrySeq {
                ctx,
                entries: entries.into_iter()
            });
        }

        match self.value {
            Value::String(s) => {
                let parts: Vec<String> = s
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect();
                visitor.visit_seq(de::value::SeqDeserializer::new(parts.into_iter()))
            }
            _ => {
                self.failed("sequence");
                visitor.visit_seq(EntrySeq {
                    ctx,
                    entries: Vec::new().into_iter()
                })
            }
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, BindError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V
    ) -> Result<V::Value, BindError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match self.value {
            Value::Map(map) => {
                let entries = map
                    .iter()
                    .map(|(name, value)| {
                        (name.clone(), Entry::Value(value, join(&self.key, name)))
                    })
                    .collect();
                visitor.visit_map(EntryAccess::new(self.ctx, entries))
            }
            _ => {
                self.failed("map");
                visitor.visit_map(EntryAccess::new(self.ctx, Vec::new()))
            }
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V
    ) -> Result<V::Value, BindError> {
        if name == "Duration" && fields == ["secs", "nanos"] {
            let (secs, nanos) = self.duration_parts().unwrap_or_else(|| {
                self.failed("duration");
                (0, 0)
            });
            let parts = [("secs", secs), ("nanos", nanos)];
            return visitor.visit_map(MapDeserializer::new(parts.into_iter()));
        }

        match self.value {
            Value::Map(map) => {
                let entries = fields
                    .iter()
                    .filter_map(|field| {
                        let key = join(&self.key, field);
                        let entry = match map.get(*field) {
                            Some(value) => Entry::Value(value, key),
                            None if self.ctx.placeholders.contains(&key) => Entry::Zero,
                            None => return None
                        };
                        Some(((*field).to_string(), entry))
                    })
                    .collect();
                visitor
                    .visit_map(EntryAccess::new(self.ctx, entries))
                    .map_err(|e| e.qualify(&self.key))
            }
            _ => {
                self.failed("struct");
                ZeroDeserializer.deserialize_struct(name, fields, visitor)
            }
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V
    ) -> Result<V::Value, BindError> {
        match self.value {
            Value::String(s) => {
                let variant: StrDeserializer<'_, BindError> = s.as_str().into_deserializer();
                visitor.visit_enum(variant)
            }
            other => Err(de::Error::custom(format!(
                "cannot bind {} value for '{}' to an enum",
                other.type_name(),
                self.key
            )))
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }
}

/// Produces the zero value of whatever is requested.
struct ZeroDeserializer;

impl<'de> Deserializer<'de> for ZeroDeserializer {
    type Error = BindError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_bool(false)
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_i8(0)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_i16(0)
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_i32(0)
    }

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_i64(0)
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_u8(0)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_u16(0)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_u32(0)
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_u64(0)
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_f32(0.0)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_f64(0.0)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_char('\0')
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_str("")
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_str("")
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_bytes(&[])
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_bytes(&[])
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_none()
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_seq(ZeroSeq { remaining: 0 })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_seq(ZeroSeq { remaining: len })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_seq(ZeroSeq { remaining: len })
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let no_fields: &'static [&'static str] = &[];
        visitor.visit_map(ZeroFields {
            fields: no_fields.iter()
        })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V
    ) -> Result<V::Value, BindError> {
        visitor.visit_map(ZeroFields {
            fields: fields.iter()
        })
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V
    ) -> Result<V::Value, BindError> {
        Err(de::Error::custom(format!("no zero value for enum {name}")))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_str("")
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_unit()
    }

    fn deserialize_i128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_i128(0)
    }

    fn deserialize_u128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_u128(0)
    }
}

struct ZeroSeq {
    remaining: usize
}

impl<'de> SeqAccess<'de> for ZeroSeq {
    type Error = BindError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, BindError>
    where
        T: DeserializeSeed<'de>
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(ZeroDeserializer).map(Some)
    }
}

struct ZeroFields {
    fields: std::slice::Iter<'static, &'static str>
}

impl<'de> MapAccess<'de> for ZeroFields {
    type Error = BindError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, BindError>
    where
        K: DeserializeSeed<'de>
    {
        match self.fields.next() {
            Some(field) => {
                let key: StrDeserializer<'_, BindError> = (*field).into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None)
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, BindError>
    where
        V: DeserializeSeed<'de>
    {
        seed.deserialize(ZeroDeserializer)
    }
}
