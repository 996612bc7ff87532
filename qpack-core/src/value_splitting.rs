//! Splitting of header values before encoding.
//!
//! A value containing NUL bytes is sent as several fields with the same
//! name, one per NUL-separated piece, so that each piece can be indexed on
//! its own. With cookie crumbling enabled, `cookie` values are split at
//! `;` instead, dropping one space after each separator (RFC 9114
//! Section 4.2.1).

use crate::field_line::FieldLine;

const COOKIE: &[u8] = b"cookie";
const COOKIE_SEPARATOR: u8 = b';';
const OPTIONAL_SPACE_AFTER_COOKIE_SEPARATOR: u8 = b' ';
const NON_COOKIE_SEPARATOR: u8 = 0;

/// Returns the header list with values split into separate fields.
///
/// Pieces share the original buffers.
pub fn split_values(header_list: &[FieldLine], cookie_crumbling: bool) -> Vec<FieldLine> {
    let mut fields = Vec::with_capacity(header_list.len());
    for field in header_list {
        let is_cookie = cookie_crumbling && field.name[..] == *COOKIE;
        let separator = if is_cookie {
            COOKIE_SEPARATOR
        } else {
            NON_COOKIE_SEPARATOR
        };

        let value = &field.value;
        let mut start = 0;
        loop {
            let end = value[start..]
                .iter()
                .position(|&byte| byte == separator)
                .map_or(value.len(), |offset| start + offset);
            fields.push(FieldLine {
                name: field.name.clone(),
                value: value.slice(start..end),
            });
            if end == value.len() {
                break;
            }
            start = end + 1;
            if is_cookie && value.get(start) == Some(&OPTIONAL_SPACE_AFTER_COOKIE_SEPARATOR) {
                start += 1;
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(name: &'static str, value: &'static str, cookie_crumbling: bool) -> Vec<String> {
        split_values(&[FieldLine::new(name, value)], cookie_crumbling)
            .into_iter()
            .map(|field| {
                assert_eq!(&field.name[..], name.as_bytes());
                String::from_utf8(field.value.to_vec()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_no_separator() {
        assert_eq!(split("foo", "bar", true), vec!["bar"]);
        assert_eq!(split("foo", "", true), vec![""]);
        assert_eq!(split("cookie", "", true), vec![""]);
    }

    #[test]
    fn test_nul_separated() {
        assert_eq!(split("foo", "bar\0baz", true), vec!["bar", "baz"]);
        assert_eq!(split("foo", "\0", true), vec!["", ""]);
        assert_eq!(split("foo", "a\0\0b", true), vec!["a", "", "b"]);
        // Semicolons only separate cookies.
        assert_eq!(split("foo", "a; b", true), vec!["a; b"]);
    }

    #[test]
    fn test_cookie_crumbling() {
        assert_eq!(split("cookie", "a=b; c=d", true), vec!["a=b", "c=d"]);
        assert_eq!(split("cookie", "a=b;c=d", true), vec!["a=b", "c=d"]);
        // Only one space is optional.
        assert_eq!(split("cookie", "a=b;  c=d", true), vec!["a=b", " c=d"]);
        assert_eq!(split("cookie", "a=b;", true), vec!["a=b", ""]);
        assert_eq!(split("cookie", "a=b; ", true), vec!["a=b", ""]);
        assert_eq!(split("cookie", ";", true), vec!["", ""]);
        // NUL does not separate cookies.
        assert_eq!(split("cookie", "a\0b", true), vec!["a\0b"]);
    }

    #[test]
    fn test_cookie_crumbling_disabled() {
        assert_eq!(split("cookie", "a=b; c=d", false), vec!["a=b; c=d"]);
        assert_eq!(split("cookie", "a\0b", false), vec!["a", "b"]);
    }

    #[test]
    fn test_order_preserved() {
        let fields = split_values(
            &[
                FieldLine::new(":method", "GET"),
                FieldLine::new("cookie", "x=1; y=2"),
                FieldLine::new("accept", "*/*"),
            ],
            true,
        );
        let names: Vec<_> = fields.iter().map(|field| &field.name[..]).collect();
        assert_eq!(names, [&b":method"[..], b"cookie", b"cookie", b"accept"]);
    }
}
