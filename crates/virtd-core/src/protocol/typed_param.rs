//! Typed parameter list codec.
//!
//! Wire form of one element:
//! ```text
//! [field:string][tag:i32][value]
//! ```
//! followed by a value whose width depends on the tag. A list is a u32 count
//! then the elements.
//!
//! Encoding drops unset slots (sparse results such as per-CPU statistics) and,
//! when the peer has not declared [`caps::TYPED_PARAM_STRING_OKAY`], every
//! string-valued element. Decoding checks the declared count against the call
//! site's ceiling before allocating.

use crate::domain::typed_param::{TypedParam, TypedParamTag, TypedValue};
use crate::protocol::codec::{CodecError, WireEncode, WireReader, WireWriter};
use crate::protocol::limits::TYPED_PARAM_FIELD_LENGTH;

/// Capability flags a peer may declare for typed parameter lists.
pub mod caps {
    /// The peer understands string-valued typed parameters.
    pub const TYPED_PARAM_STRING_OKAY: u32 = 1 << 2;
}

/// Longest field name that fits the management API's fixed buffer.
pub const FIELD_NAME_MAX: usize = TYPED_PARAM_FIELD_LENGTH - 1;

/// Smallest possible encoded element: empty name (4) + tag (4) + i32 (4).
const MIN_ELEMENT_SIZE: usize = 12;

/// A typed parameter list in the exact shape it takes on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypedParamList {
    params: Vec<TypedParam>,
}

impl TypedParamList {
    /// Builds the wire list for a peer with capability flags `caps`.
    ///
    /// The list is assembled in a fresh vector and returned only when every
    /// element validated; on error nothing partially built escapes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] when a field name does not fit
    /// [`FIELD_NAME_MAX`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use virtd_core::domain::typed_param::TypedParam;
    /// use virtd_core::protocol::typed_param::TypedParamList;
    ///
    /// let params = vec![TypedParam::uint("weight", 500), TypedParam::string("note", "x")];
    /// let list = TypedParamList::encode(&params, 0).unwrap();
    /// assert_eq!(list.as_slice(), &[TypedParam::uint("weight", 500)]);
    /// ```
    pub fn encode(params: &[TypedParam], caps: u32) -> Result<Self, CodecError> {
        let string_okay = caps & caps::TYPED_PARAM_STRING_OKAY != 0;
        let mut out = Vec::with_capacity(params.len());

        for p in params {
            match p.value.tag() {
                TypedParamTag::Unset => continue,
                TypedParamTag::String if !string_okay => {
                    tracing::trace!(field = %p.field, "dropping string parameter for peer without string support");
                    continue;
                }
                _ => {}
            }
            check_field(&p.field)?;
            out.push(p.clone());
        }

        Ok(Self { params: out })
    }

    /// Reads a wire list holding at most `max_count` elements.
    ///
    /// # Errors
    ///
    /// - [`CodecError::LimitExceeded`] when the declared count is over
    ///   `max_count`. Nothing is allocated in that case.
    /// - [`CodecError::FieldTooLong`] when a name exceeds [`FIELD_NAME_MAX`].
    /// - [`CodecError::UnknownTag`] for a tag outside the known set.
    pub fn read(r: &mut WireReader<'_>, what: &'static str, max_count: usize) -> Result<Self, CodecError> {
        let count = r.get_count(what, max_count)?;
        let mut params = Vec::with_capacity(r.capacity_hint(count, MIN_ELEMENT_SIZE));

        for _ in 0..count {
            params.push(read_param(r)?);
        }

        Ok(Self { params })
    }

    pub fn as_slice(&self) -> &[TypedParam] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_inner(self) -> Vec<TypedParam> {
        self.params
    }
}

impl From<TypedParamList> for Vec<TypedParam> {
    fn from(list: TypedParamList) -> Self {
        list.params
    }
}

impl WireEncode for TypedParamList {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_u32(self.params.len() as u32);
        for p in &self.params {
            write_param(w, p)?;
        }
        Ok(())
    }
}

// ── Element helpers ───────────────────────────────────────────────────────────

fn check_field(field: &str) -> Result<(), CodecError> {
    if field.len() > FIELD_NAME_MAX {
        return Err(CodecError::FieldTooLong {
            field: field.to_string(),
            max: FIELD_NAME_MAX,
        });
    }
    Ok(())
}

pub(crate) fn write_param(w: &mut WireWriter, p: &TypedParam) -> Result<(), CodecError> {
    check_field(&p.field)?;
    if p.value.tag() == TypedParamTag::Unset {
        return Err(CodecError::UnknownTag {
            field: p.field.clone(),
            tag: TypedParamTag::Unset as i32,
        });
    }
    w.put_string(&p.field)?;
    w.put_i32(p.value.tag() as i32);
    match &p.value {
        TypedValue::Unset => {}
        TypedValue::Int(v) => w.put_i32(*v),
        TypedValue::UInt(v) => w.put_u32(*v),
        TypedValue::LLong(v) => w.put_i64(*v),
        TypedValue::ULLong(v) => w.put_u64(*v),
        TypedValue::Double(v) => w.put_f64(*v),
        TypedValue::Boolean(v) => w.put_bool(*v),
        TypedValue::String(v) => w.put_string(v)?,
    }
    Ok(())
}

fn read_param(r: &mut WireReader<'_>) -> Result<TypedParam, CodecError> {
    let field = r.get_string()?;
    check_field(&field)?;

    let raw_tag = r.get_i32()?;
    let value = match TypedParamTag::try_from(raw_tag) {
        Ok(TypedParamTag::Int) => TypedValue::Int(r.get_i32()?),
        Ok(TypedParamTag::UInt) => TypedValue::UInt(r.get_u32()?),
        Ok(TypedParamTag::LLong) => TypedValue::LLong(r.get_i64()?),
        Ok(TypedParamTag::ULLong) => TypedValue::ULLong(r.get_u64()?),
        Ok(TypedParamTag::Double) => TypedValue::Double(r.get_f64()?),
        Ok(TypedParamTag::Boolean) => TypedValue::Boolean(r.get_bool()?),
        Ok(TypedParamTag::String) => TypedValue::String(r.get_string()?),
        Ok(TypedParamTag::Unset) | Err(()) => {
            return Err(CodecError::UnknownTag { field, tag: raw_tag });
        }
    };

    Ok(TypedParam { field, value })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::to_bytes;
    use crate::protocol::limits::{MIGRATE_PARAM_LIST_MAX, SCHEDULER_PARAMETERS_MAX};

    fn wire(params: &[TypedParam], caps: u32) -> Vec<u8> {
        to_bytes(&TypedParamList::encode(params, caps).expect("encode")).expect("bytes")
    }

    fn decode(bytes: &[u8], max: usize) -> Result<Vec<TypedParam>, CodecError> {
        let mut r = WireReader::new(bytes);
        let list = TypedParamList::read(&mut r, "parameters", max)?;
        r.finish()?;
        Ok(list.into_inner())
    }

    fn every_type() -> Vec<TypedParam> {
        vec![
            TypedParam::int("cpu_shares", -3),
            TypedParam::uint("weight", 500),
            TypedParam::llong("offset", i64::MIN),
            TypedParam::ullong("bandwidth", u64::MAX),
            TypedParam::new("ratio", TypedValue::Double(0.25)),
            TypedParam::new("live", TypedValue::Boolean(true)),
            TypedParam::string("uri", "tcp://dst.example:49152"),
        ]
    }

    #[test]
    fn test_all_types_survive_with_string_support() {
        let params = every_type();
        let bytes = wire(&params, caps::TYPED_PARAM_STRING_OKAY);
        assert_eq!(decode(&bytes, 16).expect("decode"), params);
    }

    #[test]
    fn test_strings_are_dropped_without_string_support() {
        let params = every_type();
        let expected: Vec<_> = params
            .iter()
            .filter(|p| p.value.tag() != TypedParamTag::String)
            .cloned()
            .collect();

        let bytes = wire(&params, 0);

        assert_eq!(decode(&bytes, 16).expect("decode"), expected);
    }

    #[test]
    fn test_weight_and_note_without_string_support_keeps_only_weight() {
        let params = vec![TypedParam::uint("weight", 500), TypedParam::string("note", "x")];
        let list = TypedParamList::encode(&params, 0).expect("encode");
        assert_eq!(list.as_slice(), &[TypedParam::uint("weight", 500)]);
    }

    #[test]
    fn test_unset_slots_are_skipped() {
        let params = vec![
            TypedParam::ullong("cpu_time", 10),
            TypedParam::unset(),
            TypedParam::ullong("cpu_time", 20),
        ];
        let list = TypedParamList::encode(&params, 0).expect("encode");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_encode_rejects_field_name_longer_than_buffer() {
        let name = "f".repeat(FIELD_NAME_MAX + 1);
        let err = TypedParamList::encode(&[TypedParam::uint(name.clone(), 1)], 0).unwrap_err();
        assert_eq!(
            err,
            CodecError::FieldTooLong {
                field: name,
                max: FIELD_NAME_MAX
            }
        );
    }

    #[test]
    fn test_field_name_of_exactly_max_length_is_accepted() {
        let name = "f".repeat(FIELD_NAME_MAX);
        let bytes = wire(&[TypedParam::uint(name.clone(), 1)], 0);
        assert_eq!(decode(&bytes, 1).expect("decode")[0].field, name);
    }

    #[test]
    fn test_decode_over_ceiling_is_limit_exceeded() {
        let params: Vec<_> = (0..=SCHEDULER_PARAMETERS_MAX as u32)
            .map(|i| TypedParam::uint(format!("p{i}"), i))
            .collect();
        let bytes = wire(&params, 0);

        let err = decode(&bytes, SCHEDULER_PARAMETERS_MAX).unwrap_err();

        assert_eq!(
            err,
            CodecError::LimitExceeded {
                what: "parameters",
                count: SCHEDULER_PARAMETERS_MAX + 1,
                limit: SCHEDULER_PARAMETERS_MAX
            }
        );
    }

    #[test]
    fn test_decode_huge_declared_count_fails_without_allocating() {
        // Only the count is present; a decoder that allocated first would
        // abort on a u32::MAX-element reservation.
        let bytes = u32::MAX.to_be_bytes();
        let err = decode(&bytes, MIGRATE_PARAM_LIST_MAX).unwrap_err();
        assert!(matches!(err, CodecError::LimitExceeded { .. }));
    }

    #[test]
    fn test_decode_unknown_tag_is_rejected() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_string("mystery").expect("name");
        w.put_i32(42);
        w.put_i32(0);
        let bytes = w.into_bytes();

        let err = decode(&bytes, 4).unwrap_err();

        assert_eq!(
            err,
            CodecError::UnknownTag {
                field: "mystery".into(),
                tag: 42
            }
        );
    }

    #[test]
    fn test_decode_zero_tag_is_rejected() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_string("slot").expect("name");
        w.put_i32(0);
        let bytes = w.into_bytes();
        assert!(matches!(decode(&bytes, 4), Err(CodecError::UnknownTag { tag: 0, .. })));
    }

    #[test]
    fn test_decode_rejects_long_field_from_peer() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_string(&"n".repeat(200)).expect("name");
        w.put_i32(TypedParamTag::Int as i32);
        w.put_i32(1);
        let bytes = w.into_bytes();
        assert!(matches!(decode(&bytes, 4), Err(CodecError::FieldTooLong { .. })));
    }

    #[test]
    fn test_empty_list_round_trips() {
        let bytes = wire(&[], 0);
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(decode(&bytes, 0).expect("decode").is_empty());
    }
}
