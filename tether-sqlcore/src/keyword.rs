/// Coarse statement classification used by backends that need to pick an execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Insert,
    /// UPDATE, DELETE or MERGE.
    Modify,
    Other,
}

impl StatementKind {
    pub fn classify(sql: &str) -> Self {
        match leading_keyword(sql).as_str() {
            "SELECT" | "WITH" | "VALUES" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE" => {
                Self::Query
            }
            "INSERT" => Self::Insert,
            "UPDATE" | "DELETE" | "MERGE" => Self::Modify,
            _ => Self::Other,
        }
    }

    pub fn is_dml(self) -> bool {
        matches!(self, Self::Insert | Self::Modify)
    }
}

/// Returns the first keyword of `sql`, upper-cased, skipping whitespace, comments and
/// opening parentheses.
pub fn leading_keyword(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }

    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_keyword_skips_comments_and_parens() {
        assert_eq!(leading_keyword("  select 1"), "SELECT");
        assert_eq!(leading_keyword("-- note\n insert into t values (1)"), "INSERT");
        assert_eq!(leading_keyword("/* a */ (SELECT 1) UNION (SELECT 2)"), "SELECT");
        assert_eq!(leading_keyword(""), "");
    }

    #[test]
    fn classify_groups_dml() {
        assert_eq!(StatementKind::classify("with x as (select 1) select * from x"), StatementKind::Query);
        assert_eq!(StatementKind::classify("UPDATE t SET a = 1"), StatementKind::Modify);
        assert_eq!(StatementKind::classify("merge into t using s on 1=1"), StatementKind::Modify);
        assert_eq!(StatementKind::classify("create table t (a int)"), StatementKind::Other);
        assert!(StatementKind::Insert.is_dml());
        assert!(!StatementKind::Query.is_dml());
    }
}
