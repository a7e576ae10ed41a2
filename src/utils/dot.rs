//! DOT format escaping.

/// Escapes a string for use inside a DOT label.
///
/// Handles quotes, backslashes, line breaks, and the angle brackets DOT
/// treats as record syntax.
#[must_use]
pub fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('<', "\\<")
        .replace('>', "\\>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_dot_plain() {
        assert_eq!(escape_dot("LoadConst 7"), "LoadConst 7");
    }

    #[test]
    fn test_escape_dot_specials() {
        assert_eq!(escape_dot("a\"b"), "a\\\"b");
        assert_eq!(escape_dot("x<y>"), "x\\<y\\>");
    }
}
