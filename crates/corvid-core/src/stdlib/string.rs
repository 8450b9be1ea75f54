//! `string` library
//!
//! Strings are byte strings; case conversion is ASCII only. `find` does
//! plain substring search and `format` supports the common C conversions.

use super::{new_lib, LibFn};
use crate::gc::Handle;
use crate::value::Value;
use crate::vm::{VmResult, VM};

/// Largest string `rep` and `format` will build
const MAX_STRING_SIZE: usize = 1 << 30;

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("len", len),
    ("sub", sub),
    ("upper", upper),
    ("lower", lower),
    ("rep", rep),
    ("reverse", reverse),
    ("byte", byte),
    ("char", char),
    ("format", format),
    ("find", find),
    ("split", split),
];

pub(crate) fn open(vm: &mut VM) -> Handle {
    new_lib(vm, "string", FUNCTIONS)
}

/// Resolve a possibly negative 1-based position against a length
fn relative_position(pos: i64, len: usize) -> i64 {
    if pos >= 0 {
        pos
    } else if pos.unsigned_abs() as usize > len {
        0
    } else {
        len as i64 + pos + 1
    }
}

fn len(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    vm.push_number(s.len() as f64);
    Ok(1)
}

fn sub(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    let i = vm.opt_integer(2, 1)?;
    let j = vm.opt_integer(3, -1)?;
    let start = relative_position(i, s.len()).max(1) as usize;
    let end = relative_position(j, s.len()).min(s.len() as i64);
    if end < start as i64 {
        vm.push_string("");
    } else {
        vm.push_bytes(&s[start - 1..end as usize]);
    }
    Ok(1)
}

fn upper(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    vm.push_bytes(&s.to_ascii_uppercase());
    Ok(1)
}

fn lower(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    vm.push_bytes(&s.to_ascii_lowercase());
    Ok(1)
}

fn rep(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    let n = vm.check_integer(2)?;
    if n <= 0 || s.is_empty() {
        vm.push_string("");
        return Ok(1);
    }
    let n = n as usize;
    if s.len().saturating_mul(n) > MAX_STRING_SIZE {
        return Err(vm.raise_message("resulting string too large"));
    }
    vm.push_bytes(&s.repeat(n));
    Ok(1)
}

fn reverse(vm: &mut VM) -> VmResult<usize> {
    let mut s = vm.check_string(1)?;
    s.reverse();
    vm.push_bytes(&s);
    Ok(1)
}

fn byte(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    let i = vm.opt_integer(2, 1)?;
    let j = vm.opt_integer(3, i)?;
    let start = relative_position(i, s.len()).max(1) as usize;
    let end = relative_position(j, s.len()).min(s.len() as i64);
    if end < start as i64 {
        return Ok(0);
    }
    let codes = &s[start - 1..end as usize];
    for &code in codes {
        vm.push_number(f64::from(code));
    }
    Ok(codes.len())
}

fn char(vm: &mut VM) -> VmResult<usize> {
    let mut bytes = Vec::with_capacity(vm.arg_count());
    for arg in 1..=vm.arg_count() {
        let code = vm.check_integer(arg)?;
        match u8::try_from(code) {
            Ok(b) => bytes.push(b),
            Err(_) => return Err(vm.arg_error(arg, "value out of range")),
        }
    }
    vm.push_bytes(&bytes);
    Ok(1)
}

fn find(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    let pattern = vm.check_string(2)?;
    let init = relative_position(vm.opt_integer(3, 1)?, s.len()).max(1) as usize;
    if init > s.len() + 1 {
        vm.push_nil();
        return Ok(1);
    }
    let found = if pattern.is_empty() {
        Some(init - 1)
    } else {
        s[init - 1..]
            .windows(pattern.len())
            .position(|window| window == pattern.as_slice())
            .map(|offset| init - 1 + offset)
    };
    match found {
        Some(at) => {
            vm.push_number((at + 1) as f64);
            vm.push_number((at + pattern.len()) as f64);
            Ok(2)
        }
        None => {
            vm.push_nil();
            Ok(1)
        }
    }
}

fn split(vm: &mut VM) -> VmResult<usize> {
    let s = vm.check_string(1)?;
    let separator = if vm.arg(2).is_nil() {
        b",".to_vec()
    } else {
        vm.check_string(2)?
    };
    let pieces: Vec<&[u8]> = if separator.is_empty() {
        s.chunks(1).collect()
    } else {
        let mut pieces = Vec::new();
        let mut rest = s.as_slice();
        while let Some(at) = rest.windows(separator.len()).position(|w| w == separator.as_slice()) {
            pieces.push(&rest[..at]);
            rest = &rest[at + separator.len()..];
        }
        pieces.push(rest);
        pieces
    };
    let table = vm.heap.new_table(pieces.len(), 0);
    vm.push_value(Value::Table(table));
    for (i, piece) in pieces.iter().enumerate() {
        let value = Value::String(vm.heap.intern(piece));
        vm.heap.table_set_int(table, i + 1, value);
    }
    vm.after_alloc();
    Ok(1)
}

// ===== format =====

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    /// Pad `body` (with an optional sign or prefix) to the field width
    fn pad(&self, sign: &str, body: &str, numeric: bool) -> String {
        let len = sign.len() + body.len();
        if len >= self.width {
            return format!("{sign}{body}");
        }
        let fill = self.width - len;
        if self.left {
            format!("{sign}{body}{}", " ".repeat(fill))
        } else if self.zero && numeric {
            format!("{sign}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{sign}{body}", " ".repeat(fill))
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }
}

/// Parse flags, width and precision after a `%`; returns the spec and the
/// conversion byte's position
fn parse_spec(fmt: &[u8], mut at: usize) -> Option<(Spec, usize)> {
    let mut spec = Spec::default();
    while let Some(&c) = fmt.get(at) {
        match c {
            b'-' => spec.left = true,
            b'0' => spec.zero = true,
            b'+' => spec.plus = true,
            b' ' => spec.space = true,
            b'#' => spec.alternate = true,
            _ => break,
        }
        at += 1;
    }
    let digits = |at: &mut usize| {
        let mut n = 0usize;
        let mut count = 0;
        while let Some(d) = fmt.get(*at).filter(|c| c.is_ascii_digit()) {
            n = n * 10 + usize::from(d - b'0');
            *at += 1;
            count += 1;
        }
        (n, count)
    };
    let (width, count) = digits(&mut at);
    if count > 2 {
        return None;
    }
    spec.width = width;
    if fmt.get(at) == Some(&b'.') {
        at += 1;
        let (precision, count) = digits(&mut at);
        if count > 2 {
            return None;
        }
        spec.precision = Some(precision);
    }
    fmt.get(at).map(|_| (spec, at))
}

/// C `%g`: shortest of `%e` and `%f` at the given significant digits
fn format_general(value: f64, precision: usize, alternate: bool) -> String {
    if !value.is_finite() {
        return format_non_finite(value);
    }
    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let exponent: i32 = scientific
        .rsplit('e')
        .next()
        .and_then(|e| e.parse().ok())
        .unwrap_or(0);
    let strip = |text: String| {
        if alternate || !text.contains('.') {
            text
        } else {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    };
    if exponent < -4 || exponent >= precision as i32 {
        let (mantissa, _) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
        let mantissa = strip(mantissa.to_string());
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip(format!("{value:.decimals$}"))
    }
}

fn format_non_finite(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value > 0.0 {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}

fn quote(bytes: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\0' => {
                if iter.peek().is_some_and(|next| next.is_ascii_digit()) {
                    out.extend_from_slice(b"\\000");
                } else {
                    out.extend_from_slice(b"\\0");
                }
            }
            c if c.is_ascii_control() => out.extend_from_slice(format!("\\{c}").as_bytes()),
            c => out.push(c),
        }
    }
    out.push(b'"');
}

fn integer_arg(vm: &mut VM, arg: usize) -> VmResult<i64> {
    let n = vm.check_number(arg)?;
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(vm.arg_error(arg, "number has no integer representation"));
    }
    Ok(n as i64)
}

fn format(vm: &mut VM) -> VmResult<usize> {
    let fmt = vm.check_string(1)?;
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg = 1;
    let mut i = 0;
    while i < fmt.len() {
        let c = fmt[i];
        i += 1;
        if c != b'%' {
            out.push(c);
            continue;
        }
        if fmt.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }
        let Some((spec, at)) = parse_spec(&fmt, i) else {
            return Err(vm.raise_message("invalid format (width or precision too long)"));
        };
        let conversion = fmt[at];
        i = at + 1;
        arg += 1;
        let piece = match conversion {
            b'd' | b'i' => {
                let n = integer_arg(vm, arg)?;
                let mut digits = n.unsigned_abs().to_string();
                if let Some(p) = spec.precision {
                    if digits.len() < p {
                        digits = format!("{}{digits}", "0".repeat(p - digits.len()));
                    }
                }
                spec.pad(spec.sign(n < 0), &digits, spec.precision.is_none())
            }
            b'x' | b'X' => {
                let n = integer_arg(vm, arg)? as u64;
                let digits = if conversion == b'x' {
                    format!("{n:x}")
                } else {
                    format!("{n:X}")
                };
                let prefix = match (spec.alternate && n != 0, conversion) {
                    (true, b'x') => "0x",
                    (true, _) => "0X",
                    _ => "",
                };
                spec.pad(prefix, &digits, true)
            }
            b'f' | b'F' => {
                let n = vm.check_number(arg)?;
                let body = if n.is_finite() {
                    let precision = spec.precision.unwrap_or(6);
                    format!("{:.*}", precision, n.abs())
                } else {
                    format_non_finite(n.abs())
                };
                spec.pad(spec.sign(n.is_sign_negative() && n != 0.0), &body, n.is_finite())
            }
            b'g' | b'G' => {
                let n = vm.check_number(arg)?;
                let mut body = format_general(n.abs(), spec.precision.unwrap_or(6), spec.alternate);
                if conversion == b'G' {
                    body = body.to_uppercase();
                }
                spec.pad(spec.sign(n.is_sign_negative() && n != 0.0), &body, n.is_finite())
            }
            b'c' => {
                let code = integer_arg(vm, arg)?;
                out.push(code as u8);
                continue;
            }
            b's' => {
                let value = vm.check_any(arg)?;
                let text = vm.tostring_value(value)?;
                let Value::String(h) = text else {
                    return Err(vm.arg_error(arg, "string expected"));
                };
                let mut bytes = vm.heap.string(h).to_vec();
                if let Some(p) = spec.precision {
                    bytes.truncate(p);
                }
                if bytes.len() >= spec.width {
                    out.extend_from_slice(&bytes);
                } else {
                    let fill = vec![b' '; spec.width - bytes.len()];
                    if spec.left {
                        out.extend_from_slice(&bytes);
                        out.extend_from_slice(&fill);
                    } else {
                        out.extend_from_slice(&fill);
                        out.extend_from_slice(&bytes);
                    }
                }
                continue;
            }
            b'q' => {
                match vm.check_any(arg)? {
                    Value::String(h) => {
                        let bytes = vm.heap.string(h).to_vec();
                        quote(&bytes, &mut out);
                    }
                    value @ (Value::Number(_) | Value::Integer(_) | Value::UnsignedInteger(_)) => {
                        out.extend_from_slice(vm.display_value(value).as_bytes());
                    }
                    Value::Nil => out.extend_from_slice(b"nil"),
                    Value::Boolean(b) => out.extend_from_slice(if b { b"true" } else { b"false" }),
                    _ => return Err(vm.arg_error(arg, "value has no literal form")),
                }
                continue;
            }
            other => {
                let text = String::from_utf8_lossy(&[other]).into_owned();
                return Err(vm.raise_message(format!("invalid conversion '%{text}' to 'format'")));
            }
        };
        out.extend_from_slice(piece.as_bytes());
        if out.len() > MAX_STRING_SIZE {
            return Err(vm.raise_message("resulting string too large"));
        }
    }
    vm.push_bytes(&out);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::format_general;
    use crate::testutil::{run, run_err};

    #[test]
    fn test_sub_and_negative_indices() {
        assert_eq!(
            run("local s = 'hello' return s:sub(2, 4), s:sub(-3), s:sub(0), s:sub(4, 2), s:sub(-100, 2)").unwrap(),
            vec!["ell", "llo", "hello", "", "he"]
        );
    }

    #[test]
    fn test_case_rep_reverse_len() {
        assert_eq!(
            run("return string.upper('MiXed'), string.lower('MiXed'), string.rep('ab', 3), string.rep('x', 0), ('abc'):reverse(), #'four', string.len('')")
                .unwrap(),
            vec!["MIXED", "mixed", "ababab", "", "cba", "4", "0"]
        );
    }

    #[test]
    fn test_byte_and_char() {
        assert_eq!(run("return string.byte('ABC', 1, -1)").unwrap(), vec!["65", "66", "67"]);
        assert_eq!(run("return string.byte('A')").unwrap(), vec!["65"]);
        assert_eq!(run("return string.char(104, 105)").unwrap(), vec!["hi"]);
        assert!(run_err("return string.char(256)").contains("value out of range"));
    }

    #[test]
    fn test_find_is_plain() {
        assert_eq!(run("return string.find('a.b.c', '.', 1, true)").unwrap(), vec!["2", "2"]);
        assert_eq!(run("return ('hello world'):find('o w')").unwrap(), vec!["5", "7"]);
        assert_eq!(run("return ('hello'):find('l', 4)").unwrap(), vec!["4", "4"]);
        assert_eq!(run("return ('hello'):find('z')").unwrap(), vec!["nil"]);
    }

    #[test]
    fn test_split() {
        let source = r"
            local parts = string.split('a,b,,c', ',')
            local words = ('one two'):split(' ')
            return #parts, parts[3], parts[4], words[2], #string.split('abc', '')
        ";
        assert_eq!(run(source).unwrap(), vec!["4", "", "c", "two", "3"]);
    }

    #[test]
    fn test_format_conversions() {
        let source = r#"
            return string.format('%d|%5d|%-5d|%05d|%+d', 42, 42, 42, 42, 42),
                   string.format('%.2f|%8.3f|%f', 3.14159, 2.5, 1),
                   string.format('%g|%g|%g|%g', 100000, 1e20, 0.0001, 2.5),
                   string.format('%x|%X|%#x', 255, 255, 255),
                   string.format('%s and %s|%5s|%.2s', 'a', 1, 'x', 'abc'),
                   string.format('%q', 'he said "hi"\n'),
                   string.format('100%%')
        "#;
        assert_eq!(
            run(source).unwrap(),
            vec![
                "42|   42|42   |00042|+42",
                "3.14|   2.500|1.000000",
                "100000|1e+20|0.0001|2.5",
                "ff|FF|0xff",
                "a and 1|    x|ab",
                "\"he said \\\"hi\\\"\\n\"",
                "100%",
            ]
        );
    }

    #[test]
    fn test_format_errors() {
        assert!(run_err("return string.format('%d', 1.5)").contains("number has no integer representation"));
        assert!(run_err("return string.format('%d')").contains("bad argument #2 to 'format'"));
        assert!(run_err("return string.format('%y', 1)").contains("invalid conversion"));
    }

    #[test]
    fn test_general_format_matches_c() {
        assert_eq!(format_general(0.1, 6, false), "0.1");
        assert_eq!(format_general(123_456_789.0, 6, false), "1.23457e+08");
        assert_eq!(format_general(1e-5, 6, false), "1e-05");
        assert_eq!(format_general(0.0, 6, false), "0");
    }
}
