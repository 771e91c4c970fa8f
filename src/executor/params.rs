use libsql::Value;
use libsql::params::Params;

use crate::types::RowValues;

/// Convert a parameter to its libsql storage value.
///
/// `Bool` binds as 0/1, `Timestamp` as `YYYY-MM-DD HH:MM:SS[.f]` text and `JSON` as its
/// serialized text.
pub(crate) fn to_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(json) => Value::Text(json.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

pub(crate) fn positional(values: &[RowValues]) -> Params {
    if values.is_empty() {
        Params::None
    } else {
        Params::Positional(values.iter().map(to_value).collect())
    }
}

/// `names` are the resolved placeholder names, in the same order as `values`.
pub(crate) fn named(names: Vec<String>, values: &[(&str, RowValues)]) -> Params {
    if values.is_empty() {
        Params::None
    } else {
        Params::Named(
            names
                .into_iter()
                .zip(values.iter().map(|(_, v)| to_value(v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;

    #[test]
    fn encodes_non_native_types_as_storage_classes() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert!(matches!(to_value(&RowValues::Bool(true)), Value::Integer(1)));
        assert!(matches!(
            to_value(&RowValues::Timestamp(ts)),
            Value::Text(ref s) if s == "2024-03-01 12:30:00"
        ));
        assert!(matches!(
            to_value(&RowValues::JSON(json!({"k": [1, 2]}))),
            Value::Text(ref s) if s == r#"{"k":[1,2]}"#
        ));
    }

    #[test]
    fn empty_bindings_bind_nothing() {
        assert!(matches!(positional(&[]), Params::None));
        assert!(matches!(named(Vec::new(), &[]), Params::None));
    }

    #[test]
    fn named_pairs_keep_resolved_names() {
        let params = named(
            vec![":id".into(), ":name".into()],
            &[("id", RowValues::Int(7)), ("name", RowValues::from("x"))],
        );
        let Params::Named(pairs) = params else {
            panic!("expected named params");
        };
        assert_eq!(pairs[0].0, ":id");
        assert!(matches!(pairs[0].1, Value::Integer(7)));
        assert_eq!(pairs[1].0, ":name");
        assert!(matches!(pairs[1].1, Value::Text(ref s) if s == "x"));
    }
}
