//! Compile-time constants stored in a prototype's constant pool

/// A constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    /// Raw bytes; corvid strings are not required to be UTF-8
    String(Vec<u8>),
}

impl Constant {
    /// Whether the value is truthy under Lua rules (only `nil` and `false` are not)
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Constant::Nil | Constant::Boolean(false))
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Constant::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Key used to deduplicate pool entries; numbers compare by bit pattern
    /// so `0` and `-0` (and distinct NaNs) stay separate.
    #[must_use]
    pub(crate) fn dedup_key(&self) -> ConstantKey {
        match self {
            Constant::Nil => ConstantKey::Nil,
            Constant::Boolean(b) => ConstantKey::Boolean(*b),
            Constant::Number(n) => ConstantKey::Number(n.to_bits()),
            Constant::String(s) => ConstantKey::String(s.clone()),
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Nil => f.write_str("nil"),
            Constant::Boolean(b) => write!(f, "{b}"),
            Constant::Number(n) => f.write_str(&crate::value::number::format_number(*n)),
            Constant::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConstantKey {
    Nil,
    Boolean(bool),
    Number(u64),
    String(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Constant::Nil.is_truthy());
        assert!(!Constant::Boolean(false).is_truthy());
        assert!(Constant::Number(0.0).is_truthy());
        assert!(Constant::String(Vec::new()).is_truthy());
    }

    #[test]
    fn signed_zero_keys_differ() {
        assert_ne!(
            Constant::Number(0.0).dedup_key(),
            Constant::Number(-0.0).dedup_key()
        );
    }
}
