use thiserror::Error as ThisError;

use crate::literal::LiteralFormatter;
use crate::param::SqlParam;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum BindError {
    #[error("Missing value for parameter {index}")]
    MissingParameter { index: usize },

    #[error("Invalid value for parameter of type '{data_type}'")]
    InvalidValue { data_type: String },
}

/// Replaces every `?` outside single-quoted literals with the next parameter rendered as a
/// literal.
///
/// Quote state toggles on each `'`, so a doubled `''` inside a literal leaves the scanner in
/// the same state. Extra parameters are ignored.
pub fn bind_parameters(
    sql: &str,
    params: &[SqlParam],
    literals: &dyn LiteralFormatter,
) -> Result<String, BindError> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut in_quote = false;
    let mut next = 0usize;

    for c in sql.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '?' if !in_quote => {
                let param = params
                    .get(next)
                    .ok_or(BindError::MissingParameter { index: next })?;
                out.push_str(&literals.literal(param)?);
                next += 1;
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{AnsiLiterals, OdbcEscapeLiterals};

    #[test]
    fn question_mark_inside_literal_is_preserved() {
        let sql = bind_parameters("SELECT '?' , ?", &[SqlParam::Int(42)], &AnsiLiterals).unwrap();
        assert_eq!(sql, "SELECT '?' , 42");
    }

    #[test]
    fn text_parameters_are_quoted() {
        let sql = bind_parameters(
            "UPDATE t SET name = ? WHERE id = ?",
            &[SqlParam::Text("O'Hara".into()), SqlParam::Int(3)],
            &AnsiLiterals,
        )
        .unwrap();
        assert_eq!(sql, "UPDATE t SET name = 'O''Hara' WHERE id = 3");
    }

    #[test]
    fn doubled_quotes_keep_scanner_inside_literal() {
        let sql = bind_parameters("SELECT 'it''s ?', ?", &[SqlParam::Null], &AnsiLiterals).unwrap();
        assert_eq!(sql, "SELECT 'it''s ?', NULL");
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let err = bind_parameters("SELECT ?, ?", &[SqlParam::Int(1)], &AnsiLiterals).unwrap_err();
        assert_eq!(err, BindError::MissingParameter { index: 1 });
    }

    #[test]
    fn formatter_controls_boolean_rendering() {
        let sql = bind_parameters("SELECT ?", &[SqlParam::Bool(true)], &OdbcEscapeLiterals).unwrap();
        assert_eq!(sql, "SELECT 1");
    }
}
