//! JSON encoding of proto enum fields.
//!
//! Enum fields are written as their proto value names, e.g.
//! `"CHECK_RESULT_ALLOWED"`. Both names and numbers are accepted on input.

use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum EnumValue {
    Name(String),
    Number(i32),
}

macro_rules! proto_enum_json {
    ($module:ident, $enum:ty) => {
        #[doc = concat!("Serde adapter for `", stringify!($enum), "` fields.")]
        pub mod $module {
            use super::*;

            /// Writes the value name, or the raw number for unknown values.
            pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
                match <$enum>::try_from(*value) {
                    Ok(known) => serializer.serialize_str(known.as_str_name()),
                    Err(_) => serializer.serialize_i32(*value),
                }
            }

            /// Reads a value name or number.
            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
                match EnumValue::deserialize(deserializer)? {
                    EnumValue::Number(n) => Ok(n),
                    EnumValue::Name(name) => <$enum>::from_str_name(&name)
                        .map(|v| v as i32)
                        .ok_or_else(|| {
                            serde::de::Error::custom(format!(
                                "unknown {} value {name:?}",
                                stringify!($enum)
                            ))
                        }),
                }
            }
        }
    };
}

proto_enum_json!(check_result, crate::proto::CheckResult);
proto_enum_json!(data_change_operation, crate::proto::DataChangeOperation);
