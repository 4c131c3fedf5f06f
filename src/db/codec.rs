//! Bidirectional mapping between protobuf records and Redis hash fields.
//!
//! Whole records store every top-level singular field under its protobuf name. List-indexed
//! records store the wire bytes of sub-message `i` at `v<i>` and its version at `V<i>`, so many
//! sub-records share one hash key. Every stored value except versions starts with `&`, which
//! tells an empty value apart from an absent field.

use std::collections::BTreeMap;
use std::collections::HashMap;

use prost::Message;

use crate::constants::CAS_VERSION_FIELD;
use crate::constants::FORCE_UPDATE_VERSION;
use crate::constants::LIST_INDEX_FIELD;
use crate::constants::LIST_VALUE_PREFIX;
use crate::constants::LIST_VERSION_PREFIX;
use crate::constants::VALUE_MARKER;
use crate::CodecError;

/// One hash field as sent to Redis.
pub type RedisField = (String, Vec<u8>);

/// A single protobuf field value that can live in its own hash field.
pub trait HashFieldValue: Sized {
    fn encode_value(&self) -> Vec<u8>;

    fn decode_value(
        field: &str,
        raw: &[u8],
    ) -> Result<Self, CodecError>;
}

/// A protobuf message stored field-by-field in a Redis hash.
///
/// Implemented through [`impl_hash_record!`](crate::impl_hash_record) by listing the singular
/// fields of the message. Repeated and map fields are left out.
pub trait HashRecord: Message + Default + Clone + Send + Sync + 'static {
    fn field_names() -> &'static [&'static str];

    /// Raw values of every listed field, without the `&` marker.
    fn encode_fields(&self) -> Vec<(&'static str, Vec<u8>)>;

    /// Sets one field from its raw value. Returns `false` for a name the record does not have.
    fn decode_field(
        &mut self,
        name: &str,
        raw: &[u8],
    ) -> Result<bool, CodecError>;
}

/// Implements [`HashRecord`] for a prost message from the list of its singular fields.
///
/// ```ignore
/// impl_hash_record!(UserTable { uid, lv, nickname, profile });
/// ```
#[macro_export]
macro_rules! impl_hash_record {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::HashRecord for $ty {
            fn field_names() -> &'static [&'static str] {
                &[$(stringify!($field)),*]
            }

            fn encode_fields(&self) -> ::std::vec::Vec<(&'static str, ::std::vec::Vec<u8>)> {
                ::std::vec![$((stringify!($field), $crate::HashFieldValue::encode_value(&self.$field))),*]
            }

            fn decode_field(
                &mut self,
                name: &str,
                raw: &[u8],
            ) -> ::std::result::Result<bool, $crate::CodecError> {
                match name {
                    $(stringify!($field) => {
                        self.$field = $crate::HashFieldValue::decode_value(name, raw)?;
                        Ok(true)
                    })*
                    _ => Ok(false),
                }
            }
        }
    };
}

fn invalid(
    field: &str,
    reason: impl ToString,
) -> CodecError {
    CodecError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn as_str<'a>(
    field: &str,
    raw: &'a [u8],
) -> Result<&'a str, CodecError> {
    std::str::from_utf8(raw).map_err(|e| invalid(field, e))
}

impl HashFieldValue for String {
    fn encode_value(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_value(
        field: &str,
        raw: &[u8],
    ) -> Result<Self, CodecError> {
        as_str(field, raw).map(str::to_string)
    }
}

impl HashFieldValue for Vec<u8> {
    fn encode_value(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode_value(
        _field: &str,
        raw: &[u8],
    ) -> Result<Self, CodecError> {
        Ok(raw.to_vec())
    }
}

impl HashFieldValue for bool {
    fn encode_value(&self) -> Vec<u8> {
        if *self {
            b"true".to_vec()
        } else {
            b"false".to_vec()
        }
    }

    fn decode_value(
        field: &str,
        raw: &[u8],
    ) -> Result<Self, CodecError> {
        match as_str(field, raw)? {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(invalid(field, format!("not a bool: {other}"))),
        }
    }
}

// Display of f32/f64 is the shortest exact form and never uses exponent notation
macro_rules! impl_hash_field_value_for_number {
    ($($ty:ty),*) => {
        $(impl HashFieldValue for $ty {
            fn encode_value(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }

            fn decode_value(
                field: &str,
                raw: &[u8],
            ) -> Result<Self, CodecError> {
                as_str(field, raw)?.parse::<$ty>().map_err(|e| invalid(field, e))
            }
        })*
    };
}

impl_hash_field_value_for_number!(i32, i64, u32, u64, f32, f64);

/// Sub-messages are stored as their wire bytes.
impl<M: Message + Default> HashFieldValue for Option<M> {
    fn encode_value(&self) -> Vec<u8> {
        self.as_ref().map(Message::encode_to_vec).unwrap_or_default()
    }

    fn decode_value(
        _field: &str,
        raw: &[u8],
    ) -> Result<Self, CodecError> {
        Ok(Some(M::decode(raw)?))
    }
}

fn marked(raw: Vec<u8>) -> Vec<u8> {
    let mut value = Vec::with_capacity(raw.len() + 1);
    value.push(VALUE_MARKER);
    value.extend(raw);
    value
}

/// Strips the `&` marker. `None` means the stored value is empty and decodes to the default.
fn unmarked<'a>(
    field: &str,
    value: &'a [u8],
) -> Result<Option<&'a [u8]>, CodecError> {
    if value.len() <= 1 {
        return Ok(None);
    }
    if value[0] != VALUE_MARKER {
        return Err(CodecError::MissingMarker(field.to_string()));
    }
    Ok(Some(&value[1..]))
}

fn version_arg(
    cas_version: u64,
    force_update: bool,
) -> Vec<u8> {
    if force_update {
        FORCE_UPDATE_VERSION.as_bytes().to_vec()
    } else {
        cas_version.to_string().into_bytes()
    }
}

fn parse_version(
    field: &str,
    value: &[u8],
) -> Result<u64, CodecError> {
    as_str(field, value)?.parse::<u64>().map_err(|e| invalid(field, e))
}

/// Fields of a whole record. With a version the version pair comes first, which is the layout
/// the CAS script expects.
pub fn pb_map_to_redis_kv<M: HashRecord>(
    msg: &M,
    cas_version: Option<u64>,
    force_update: bool,
) -> Vec<RedisField> {
    let fields = msg.encode_fields();
    let mut ret = Vec::with_capacity(fields.len() + 1);
    if let Some(cas_version) = cas_version {
        ret.push((CAS_VERSION_FIELD.to_string(), version_arg(cas_version, force_update)));
    }
    ret.extend(
        fields
            .into_iter()
            .map(|(name, raw)| (name.to_string(), marked(raw))),
    );
    ret
}

fn decode_kv_field<M: HashRecord>(
    msg: &mut M,
    key: &str,
    value: &[u8],
    cas_version: &mut u64,
) -> Result<(), CodecError> {
    if key == CAS_VERSION_FIELD {
        *cas_version = parse_version(key, value)?;
        return Ok(());
    }
    if key == LIST_INDEX_FIELD {
        return Ok(());
    }
    let Some(raw) = unmarked(key, value)? else {
        return Ok(());
    };
    if msg.decode_field(key, raw)? {
        Ok(())
    } else {
        Err(CodecError::FieldNotFound(key.to_string()))
    }
}

/// Populates `msg` from an `HGETALL` reply and returns the stored CAS version (0 when absent).
pub fn redis_kv_map_to_pb<M: HashRecord>(
    data: &HashMap<String, Vec<u8>>,
    msg: &mut M,
) -> Result<u64, CodecError> {
    let mut cas_version = 0;
    for (key, value) in data {
        decode_kv_field(msg, key, value, &mut cas_version)?;
    }
    Ok(cas_version)
}

/// Decodes an `HMGET` projection. The flag is `false` when every requested field was missing.
pub fn redis_slice_kv_map_to_pb<M: HashRecord>(
    fields: &[String],
    values: &[Option<Vec<u8>>],
    msg: &mut M,
) -> Result<(u64, bool), CodecError> {
    if fields.len() != values.len() {
        return Err(CodecError::LengthMismatch {
            keys: fields.len(),
            values: values.len(),
        });
    }

    let mut cas_version = 0;
    let mut record_exists = false;
    for (key, value) in fields.iter().zip(values) {
        let Some(value) = value else {
            continue;
        };
        record_exists = true;
        decode_kv_field(msg, key, value, &mut cas_version)?;
    }
    Ok((cas_version, record_exists))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListFieldKind {
    Value,
    Version,
}

pub fn list_value_field(list_index: u64) -> String {
    format!("{LIST_VALUE_PREFIX}{list_index}")
}

pub fn list_version_field(list_index: u64) -> String {
    format!("{LIST_VERSION_PREFIX}{list_index}")
}

/// Splits `v<i>` / `V<i>` into kind and index.
pub fn parse_list_field(name: &str) -> Option<(ListFieldKind, u64)> {
    let mut chars = name.chars();
    let kind = match chars.next()? {
        LIST_VALUE_PREFIX => ListFieldKind::Value,
        LIST_VERSION_PREFIX => ListFieldKind::Version,
        _ => return None,
    };
    chars.as_str().parse::<u64>().ok().map(|index| (kind, index))
}

/// Fields of one list-indexed sub-record, version pair first when present.
pub fn pb_map_to_redis_kl<M: Message>(
    msg: &M,
    cas_version: Option<u64>,
    force_update: bool,
    list_index: u64,
) -> Vec<RedisField> {
    let mut ret = Vec::with_capacity(2);
    if let Some(cas_version) = cas_version {
        ret.push((list_version_field(list_index), version_arg(cas_version, force_update)));
    }
    ret.push((list_value_field(list_index), marked(msg.encode_to_vec())));
    ret
}

/// One decoded sub-record of a list-indexed hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ListIndexMessage<M> {
    pub list_index: u64,
    /// `None` when only the version (or an empty value) is stored
    pub table: Option<M>,
    pub cas_version: u64,
}

impl<M> ListIndexMessage<M> {
    fn empty(list_index: u64) -> Self {
        Self {
            list_index,
            table: None,
            cas_version: 0,
        }
    }
}

fn decode_kl_value<M: Message + Default>(
    entry: &mut ListIndexMessage<M>,
    kind: ListFieldKind,
    field: &str,
    value: &[u8],
) -> Result<(), CodecError> {
    match kind {
        ListFieldKind::Version => entry.cas_version = parse_version(field, value)?,
        ListFieldKind::Value => {
            if let Some(raw) = unmarked(field, value)? {
                entry.table = Some(M::decode(raw)?);
            }
        }
    }
    Ok(())
}

/// Groups an `HGETALL` reply of a list-indexed hash by index, sorted by index.
pub fn redis_kl_map_to_pb<M: Message + Default>(
    data: &HashMap<String, Vec<u8>>
) -> Result<Vec<ListIndexMessage<M>>, CodecError> {
    let mut by_index: BTreeMap<u64, ListIndexMessage<M>> = BTreeMap::new();
    for (key, value) in data {
        if key == LIST_INDEX_FIELD {
            continue;
        }
        let (kind, index) =
            parse_list_field(key).ok_or_else(|| CodecError::InvalidListField(key.clone()))?;
        let entry = by_index
            .entry(index)
            .or_insert_with(|| ListIndexMessage::empty(index));
        decode_kl_value(entry, kind, key, value)?;
    }
    Ok(by_index.into_values().collect())
}

/// One requested field of a list-indexed `HMGET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisSliceKey {
    pub index: u64,
    pub kind: ListFieldKind,
}

impl RedisSliceKey {
    pub fn field_name(&self) -> String {
        match self.kind {
            ListFieldKind::Value => list_value_field(self.index),
            ListFieldKind::Version => list_version_field(self.index),
        }
    }
}

/// Slice keys for reading `list_indices`, versions included on request.
pub fn list_slice_keys(
    list_indices: &[u64],
    with_version: bool,
) -> Vec<RedisSliceKey> {
    let mut keys = Vec::with_capacity(list_indices.len() * if with_version { 2 } else { 1 });
    for &index in list_indices {
        keys.push(RedisSliceKey {
            index,
            kind: ListFieldKind::Value,
        });
        if with_version {
            keys.push(RedisSliceKey {
                index,
                kind: ListFieldKind::Version,
            });
        }
    }
    keys
}

/// Decodes an ordered `HMGET` reply of list fields. Every requested index is reported, with an
/// empty table when nothing is stored for it.
pub fn redis_slice_kl_map_to_pb<M: Message + Default>(
    keys: &[RedisSliceKey],
    values: &[Option<Vec<u8>>],
) -> Result<Vec<ListIndexMessage<M>>, CodecError> {
    if keys.len() != values.len() {
        return Err(CodecError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }

    let mut by_index: BTreeMap<u64, ListIndexMessage<M>> = BTreeMap::new();
    for (key, value) in keys.iter().zip(values) {
        let entry = by_index
            .entry(key.index)
            .or_insert_with(|| ListIndexMessage::empty(key.index));
        if let Some(value) = value {
            decode_kl_value(entry, key.kind, &key.field_name(), value)?;
        }
    }
    Ok(by_index.into_values().collect())
}
