//! Minimal SQL comment stripper used to look past comments when matching
//! transaction-control keywords (`BEGIN`, `COMMIT`, `ROLLBACK`) in a query string.
//!
//! This is not a SQL parser: it only tracks single-quoted strings, dollar-quoted
//! strings, line comments (`--`) and block comments (`/* ... */`) well enough to
//! avoid mistaking commented-out text for a real statement.

pub struct SqlCommentParser<'a> {
    sql: &'a str,
}

impl<'a> SqlCommentParser<'a> {
    pub fn new(sql: &'a str) -> Self {
        SqlCommentParser { sql }
    }

    /// Returns `self.sql` with comments replaced by single spaces.
    pub fn remove_comment_sql(&self) -> String {
        let bytes = self.sql.as_bytes();
        let mut out = String::with_capacity(bytes.len());
        let mut i = 0;
        let mut in_single_quote = false;
        let mut dollar_tag: Option<&str> = None;

        while i < bytes.len() {
            if let Some(tag) = dollar_tag {
                if self.sql[i..].starts_with(tag) {
                    out.push_str(tag);
                    i += tag.len();
                    dollar_tag = None;
                } else {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                continue;
            }

            if in_single_quote {
                out.push(bytes[i] as char);
                if bytes[i] == b'\'' {
                    in_single_quote = false;
                }
                i += 1;
                continue;
            }

            match bytes[i] {
                b'\'' => {
                    in_single_quote = true;
                    out.push('\'');
                    i += 1;
                }
                b'$' => {
                    if let Some(tag) = self.parse_dollar_tag(&self.sql[i..]) {
                        out.push_str(tag);
                        i += tag.len();
                        dollar_tag = Some(tag);
                    } else {
                        out.push('$');
                        i += 1;
                    }
                }
                b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                    i += 2;
                    let mut depth = 1;
                    while i + 1 < bytes.len() && depth > 0 {
                        if bytes[i] == b'/' && bytes[i + 1] == b'*' {
                            depth += 1;
                            i += 2;
                        } else if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                            depth -= 1;
                            i += 2;
                        } else {
                            i += 1;
                        }
                    }
                    out.push(' ');
                }
                b => {
                    out.push(b as char);
                    i += 1;
                }
            }
        }

        out
    }

    /// Recognises a `$tag$` dollar-quote delimiter starting at `s[0]`.
    fn parse_dollar_tag<'b>(&self, s: &'b str) -> Option<&'b str> {
        let bytes = s.as_bytes();
        if bytes.first() != Some(&b'$') {
            return None;
        }
        let mut end = 1;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end < bytes.len() && bytes[end] == b'$' {
            Some(&s[..=end])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_comment() {
        let sql = "BEGIN -- start a transaction\n";
        assert_eq!(
            SqlCommentParser::new(sql).remove_comment_sql().trim(),
            "BEGIN"
        );
    }

    #[test]
    fn strips_block_comment() {
        let sql = "/* noop */ COMMIT";
        assert_eq!(
            SqlCommentParser::new(sql)
                .remove_comment_sql()
                .trim()
                .trim_start(),
            "COMMIT"
        );
    }

    #[test]
    fn leaves_quoted_dashes_alone() {
        let sql = "SELECT '--not a comment'";
        assert_eq!(SqlCommentParser::new(sql).remove_comment_sql(), sql);
    }
}
