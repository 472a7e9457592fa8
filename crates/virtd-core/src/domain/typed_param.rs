//! Named, typed values used for extensible argument and result lists.

use serde::{Deserialize, Serialize};

/// Wire tag of each typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TypedParamTag {
    /// Slot left unpopulated by a sparse result.
    Unset = 0,
    Int = 1,
    UInt = 2,
    LLong = 3,
    ULLong = 4,
    Double = 5,
    Boolean = 6,
    String = 7,
}

impl TryFrom<i32> for TypedParamTag {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(TypedParamTag::Unset),
            1 => Ok(TypedParamTag::Int),
            2 => Ok(TypedParamTag::UInt),
            3 => Ok(TypedParamTag::LLong),
            4 => Ok(TypedParamTag::ULLong),
            5 => Ok(TypedParamTag::Double),
            6 => Ok(TypedParamTag::Boolean),
            7 => Ok(TypedParamTag::String),
            _ => Err(()),
        }
    }
}

/// The value half of a [`TypedParam`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Unset,
    Int(i32),
    UInt(u32),
    LLong(i64),
    ULLong(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl TypedValue {
    pub fn tag(&self) -> TypedParamTag {
        match self {
            TypedValue::Unset => TypedParamTag::Unset,
            TypedValue::Int(_) => TypedParamTag::Int,
            TypedValue::UInt(_) => TypedParamTag::UInt,
            TypedValue::LLong(_) => TypedParamTag::LLong,
            TypedValue::ULLong(_) => TypedParamTag::ULLong,
            TypedValue::Double(_) => TypedParamTag::Double,
            TypedValue::Boolean(_) => TypedParamTag::Boolean,
            TypedValue::String(_) => TypedParamTag::String,
        }
    }
}

/// One named, typed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedParam {
    pub field: String,
    pub value: TypedValue,
}

impl TypedParam {
    pub fn new(field: impl Into<String>, value: TypedValue) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }

    pub fn int(field: impl Into<String>, v: i32) -> Self {
        Self::new(field, TypedValue::Int(v))
    }

    pub fn uint(field: impl Into<String>, v: u32) -> Self {
        Self::new(field, TypedValue::UInt(v))
    }

    pub fn llong(field: impl Into<String>, v: i64) -> Self {
        Self::new(field, TypedValue::LLong(v))
    }

    pub fn ullong(field: impl Into<String>, v: u64) -> Self {
        Self::new(field, TypedValue::ULLong(v))
    }

    pub fn string(field: impl Into<String>, v: impl Into<String>) -> Self {
        Self::new(field, TypedValue::String(v.into()))
    }

    /// An empty slot in a sparse result array.
    pub fn unset() -> Self {
        Self::new(String::new(), TypedValue::Unset)
    }
}

/// Looks up a string-valued parameter by name.
pub fn find_string<'a>(params: &'a [TypedParam], field: &str) -> Option<&'a str> {
    params.iter().find_map(|p| match &p.value {
        TypedValue::String(s) if p.field == field => Some(s.as_str()),
        _ => None,
    })
}

/// Looks up an unsigned 64-bit parameter by name.
pub fn find_ullong(params: &[TypedParam], field: &str) -> Option<u64> {
    params.iter().find_map(|p| match p.value {
        TypedValue::ULLong(v) if p.field == field => Some(v),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches_value_variant() {
        assert_eq!(TypedValue::UInt(1).tag(), TypedParamTag::UInt);
        assert_eq!(TypedValue::String("x".into()).tag(), TypedParamTag::String);
        assert_eq!(TypedValue::Unset.tag(), TypedParamTag::Unset);
    }

    #[test]
    fn test_tag_try_from_rejects_eight() {
        assert_eq!(TypedParamTag::try_from(8), Err(()));
    }

    #[test]
    fn test_find_string_ignores_other_types_with_same_name() {
        let params = vec![
            TypedParam::uint("uri", 3),
            TypedParam::string("uri", "tcp://dst"),
        ];
        assert_eq!(find_string(&params, "uri"), Some("tcp://dst"));
        assert_eq!(find_ullong(&params, "bandwidth"), None);
    }
}
