use serde_json::Value;

use crate::wire::decode_buffer;

/// A statement parameter decoded from its wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Arrays and objects that are neither buffers nor typed parameters.
    Json(Value),
    Typed(TypedParam),
}

/// A parameter that carries an explicit SQL data type next to its value.
///
/// Wire form: `{"value": .., "dataType": "varchar", "maxLen": 20, "scale": 2}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedParam {
    pub value: Box<SqlParam>,
    pub data_type: String,
    pub max_len: Option<usize>,
    pub scale: Option<u32>,
}

impl SqlParam {
    pub fn from_wire(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Object(obj) => {
                if let Some(bytes) = decode_buffer(value) {
                    return Self::Bytes(bytes);
                }
                match obj.get("dataType").and_then(Value::as_str) {
                    Some(data_type) => Self::Typed(TypedParam {
                        value: Box::new(Self::from_wire(obj.get("value").unwrap_or(&Value::Null))),
                        data_type: data_type.to_string(),
                        max_len: obj
                            .get("maxLen")
                            .and_then(Value::as_u64)
                            .and_then(|n| usize::try_from(n).ok()),
                        scale: obj
                            .get("scale")
                            .and_then(Value::as_u64)
                            .and_then(|n| u32::try_from(n).ok()),
                    }),
                    None => Self::Json(value.clone()),
                }
            }
            Value::Array(_) => Self::Json(value.clone()),
        }
    }

    pub fn list_from_wire(values: &[Value]) -> Vec<Self> {
        values.iter().map(Self::from_wire).collect()
    }

    /// The value a driver should bind: typed parameters unwrap to their inner value.
    pub fn bindable(&self) -> &SqlParam {
        match self {
            Self::Typed(typed) => typed.value.bindable(),
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.bindable(), Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::buffer_value;
    use serde_json::json;

    #[test]
    fn scalars_decode_by_json_shape() {
        assert_eq!(SqlParam::from_wire(&json!(null)), SqlParam::Null);
        assert_eq!(SqlParam::from_wire(&json!(7)), SqlParam::Int(7));
        assert_eq!(SqlParam::from_wire(&json!(1.5)), SqlParam::Float(1.5));
        assert_eq!(SqlParam::from_wire(&json!("x")), SqlParam::Text("x".into()));
        assert_eq!(SqlParam::from_wire(&json!([1, 2])), SqlParam::Json(json!([1, 2])));
    }

    #[test]
    fn buffers_become_bytes() {
        let param = SqlParam::from_wire(&buffer_value(b"\x00\x01"));
        assert_eq!(param, SqlParam::Bytes(vec![0, 1]));
    }

    #[test]
    fn typed_parameter_unwraps_for_binding() {
        let param = SqlParam::from_wire(&json!({
            "value": "2024-01-02",
            "dataType": "date",
        }));
        let SqlParam::Typed(typed) = &param else {
            panic!("expected typed parameter, got {param:?}");
        };
        assert_eq!(typed.data_type, "date");
        assert_eq!(param.bindable(), &SqlParam::Text("2024-01-02".into()));
        assert!(!param.is_null());
    }
}
