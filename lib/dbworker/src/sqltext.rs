//! SQL text utilities shared by the backends.

/// Rewrite the portable `?` placeholders of an input query into a backend's
/// native numbered syntax ("$1" for PostgreSQL, "@P1" for SQL Server).
///
/// `?` inside single-quoted literals, double-quoted identifiers, or bracketed
/// identifiers is left untouched. Returns the rewritten SQL and the number of
/// placeholders found.
pub fn translate_placeholders(sql: &str, render: impl Fn(usize) -> String) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_bracket = false;

    for ch in sql.chars() {
        match ch {
            '\'' if !in_double && !in_bracket => in_single = !in_single,
            '"' if !in_single && !in_bracket => in_double = !in_double,
            '[' if !in_single && !in_double => in_bracket = true,
            ']' if in_bracket => in_bracket = false,
            '?' if !in_single && !in_double && !in_bracket => {
                count += 1;
                out.push_str(&render(count));
                continue;
            }
            _ => {}
        }
        out.push(ch);
    }
    (out, count)
}

/// Count the portable `?` placeholders without rewriting (MySQL keeps them).
pub fn count_placeholders(sql: &str) -> usize {
    translate_placeholders(sql, |_| "?".to_string()).1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_to_numbered_placeholders() {
        let (sql, n) = translate_placeholders(
            "insert into t (a, b) values (?, ?)",
            |i| format!("${i}"),
        );
        assert_eq!(sql, "insert into t (a, b) values ($1, $2)");
        assert_eq!(n, 2);
    }

    #[test]
    fn rewrites_to_sqlserver_placeholders() {
        let (sql, n) = translate_placeholders("update t set a = ? where b = ?", |i| {
            format!("@P{i}")
        });
        assert_eq!(sql, "update t set a = @P1 where b = @P2");
        assert_eq!(n, 2);
    }

    #[test]
    fn question_marks_in_literals_survive() {
        let (sql, n) =
            translate_placeholders("select '?' as q, \"odd?name\" from t where a = ?", |i| {
                format!("${i}")
            });
        assert_eq!(sql, "select '?' as q, \"odd?name\" from t where a = $1");
        assert_eq!(n, 1);
    }

    #[test]
    fn bracketed_identifiers_survive() {
        let (sql, n) =
            translate_placeholders("select [what?] from t where a = ?", |i| format!("@P{i}"));
        assert_eq!(sql, "select [what?] from t where a = @P1");
        assert_eq!(n, 1);
    }
}
