use std::collections::BTreeMap;

use crate::{Category, ScalarValue, SerError, SerializationInfo};

/// Types that can decompose themselves into an SI node.
///
/// The extension seam of the engine: implement this (and [`FromSi`]) for a
/// type and every codec and RPC transport can carry it.
pub trait ToSi {
    fn to_si(&self, si: &mut SerializationInfo);
}

/// Types that can rebuild themselves from an SI node.
pub trait FromSi: Sized {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError>;
}

/// Decomposes `value` into a fresh node.
pub fn to_si<T: ToSi + ?Sized>(value: &T) -> SerializationInfo {
    let mut si = SerializationInfo::new();
    value.to_si(&mut si);
    si
}

/// Rebuilds a `T` from `si`.
pub fn from_si<T: FromSi>(si: &SerializationInfo) -> Result<T, SerError> {
    T::from_si(si)
}

macro_rules! int_to_si {
    ($($t:ty),*) => {$(
        impl ToSi for $t {
            fn to_si(&self, si: &mut SerializationInfo) {
                si.set_value(i64::from(*self));
                si.set_type_name("int");
            }
        }
        impl FromSi for $t {
            fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
                let v = si.as_i64()?;
                <$t>::try_from(v).map_err(|_| SerError::NotConvertible {
                    value: v.to_string(),
                    target: stringify!($t),
                })
            }
        }
    )*};
}

int_to_si!(i8, i16, i32, i64);

macro_rules! uint_to_si {
    ($($t:ty),*) => {$(
        impl ToSi for $t {
            fn to_si(&self, si: &mut SerializationInfo) {
                si.set_value(u64::from(*self));
                si.set_type_name("int");
            }
        }
        impl FromSi for $t {
            fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
                let v = si.as_u64()?;
                <$t>::try_from(v).map_err(|_| SerError::NotConvertible {
                    value: v.to_string(),
                    target: stringify!($t),
                })
            }
        }
    )*};
}

uint_to_si!(u8, u16, u32, u64);

impl ToSi for f64 {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_value(*self);
        si.set_type_name("double");
    }
}

impl FromSi for f64 {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        si.as_f64()
    }
}

impl ToSi for f32 {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_value(f64::from(*self));
        si.set_type_name("double");
    }
}

impl FromSi for f32 {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        Ok(si.as_f64()? as f32)
    }
}

impl ToSi for bool {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_value(*self);
        si.set_type_name("bool");
    }
}

impl FromSi for bool {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        si.as_bool()
    }
}

impl ToSi for str {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_value(self);
        si.set_type_name("string");
    }
}

impl ToSi for String {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_value(self.as_str());
        si.set_type_name("string");
    }
}

impl FromSi for String {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        Ok(si.as_str())
    }
}

impl ToSi for SerializationInfo {
    fn to_si(&self, si: &mut SerializationInfo) {
        let name = si.name().to_string();
        *si = self.clone();
        si.set_name(name);
    }
}

impl FromSi for SerializationInfo {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        Ok(si.clone())
    }
}

impl<T: ToSi> ToSi for Vec<T> {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_category(Category::Array);
        si.set_type_name("array");
        for item in self {
            let mut child = SerializationInfo::new();
            item.to_si(&mut child);
            si.push_member(child);
        }
    }
}

impl<T: FromSi> FromSi for Vec<T> {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        if si.category() != Category::Array && si.category() != Category::Object {
            return Err(SerError::TypeMismatch { expected: "array", found: si.scalar().kind() });
        }
        si.members().iter().map(T::from_si).collect()
    }
}

impl<T: ToSi> ToSi for Option<T> {
    fn to_si(&self, si: &mut SerializationInfo) {
        match self {
            Some(v) => v.to_si(si),
            None => {
                si.set_category(Category::Value);
                si.set_value(ScalarValue::Empty);
            }
        }
    }
}

impl<T: FromSi> FromSi for Option<T> {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        if si.is_null() { Ok(None) } else { T::from_si(si).map(Some) }
    }
}

impl<T: ToSi> ToSi for BTreeMap<String, T> {
    fn to_si(&self, si: &mut SerializationInfo) {
        si.set_category(Category::Object);
        si.set_type_name("map");
        for (key, value) in self {
            let member = si.add_member(key.clone());
            value.to_si(member);
        }
    }
}

impl<T: FromSi> FromSi for BTreeMap<String, T> {
    fn from_si(si: &SerializationInfo) -> Result<Self, SerError> {
        if si.category() != Category::Object {
            return Err(SerError::TypeMismatch { expected: "object", found: si.scalar().kind() });
        }
        si.members()
            .iter()
            .map(|m| Ok((m.name().to_string(), T::from_si(m)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        assert_eq!(from_si::<i32>(&to_si(&42i32)).unwrap(), 42);
        assert_eq!(from_si::<u8>(&to_si(&200u8)).unwrap(), 200);
        assert_eq!(from_si::<f64>(&to_si(&2.5f64)).unwrap(), 2.5);
        assert!(from_si::<bool>(&to_si(&true)).unwrap());
        assert_eq!(from_si::<String>(&to_si("hi")).unwrap(), "hi");
    }

    #[test]
    fn narrowing_is_checked() {
        let si = to_si(&300i64);
        assert!(from_si::<i8>(&si).is_err());
        let si = to_si(&-1i64);
        assert!(from_si::<u32>(&si).is_err());
    }

    #[test]
    fn vec_roundtrip() {
        let v = vec![1i64, 2, 3];
        let si = to_si(&v);
        assert_eq!(si.category(), Category::Array);
        assert_eq!(from_si::<Vec<i64>>(&si).unwrap(), v);
    }

    #[test]
    fn option_roundtrip() {
        let si = to_si(&Some(5i64));
        assert_eq!(from_si::<Option<i64>>(&si).unwrap(), Some(5));
        let si = to_si(&None::<i64>);
        assert_eq!(from_si::<Option<i64>>(&si).unwrap(), None);
    }

    #[test]
    fn map_roundtrip() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), 1i64);
        m.insert("b".to_string(), 2i64);
        let si = to_si(&m);
        assert_eq!(from_si::<BTreeMap<String, i64>>(&si).unwrap(), m);
    }
}
