//! Token kinds for the corvid lexer

use logos::Logos;

/// The kind of token produced by the lexer
///
/// Long brackets (`[[ ]]`, `--[[ ]]`) and backtick strings are recognised by
/// the lexer driver before logos sees the input, so their variants carry no
/// pattern.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n\f\x0B]+")]
#[logos(skip r"--[^\n]*")]
pub enum TokenKind {
    // ========== Keywords ==========
    #[token("and")]
    And,
    #[token("break")]
    Break,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    Elseif,
    #[token("end")]
    End,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("if")]
    If,
    #[token("in")]
    In,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("repeat")]
    Repeat,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("until")]
    Until,
    #[token("while")]
    While,

    // ========== Names and literals ==========
    /// Identifier; `continue`, `type` and `export` are contextual and lex as names
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Name,

    /// Decimal number with optional fraction and exponent
    #[regex(r"[0-9][0-9_]*(\.[0-9_]*)?([eE][+-]?[0-9_]+)?")]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9_]+)?")]
    Number,

    #[regex(r"0[xX][0-9a-fA-F_]+")]
    HexNumber,

    #[regex(r"0[bB][01_]+")]
    BinaryNumber,

    /// Single- or double-quoted string; the lexeme keeps quotes and escapes
    #[regex(r#""([^"\\\n]|\\(.|\n))*""#)]
    #[regex(r"'([^'\\\n]|\\(.|\n))*'")]
    QuotedString,

    /// `[[...]]` or `[==[...]==]`; the lexeme is the raw contents
    LongString,

    // ========== Interpolated strings ==========
    /// Opening backtick
    #[token("`")]
    InterpStart,

    /// Literal text between interpolations (raw, escapes not yet decoded)
    InterpText,

    /// `{` opening an embedded expression
    InterpOpen,

    /// `}` closing an embedded expression
    InterpClose,

    /// Closing backtick
    InterpEnd,

    // ========== Operators ==========
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    SlashSlash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("..")]
    DotDot,
    #[token("...")]
    Ellipsis,

    #[token("==")]
    EqEq,
    #[token("~=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("=")]
    Assign,

    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("//=")]
    SlashSlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("^=")]
    CaretAssign,
    #[token("..=")]
    DotDotAssign,

    /// Type syntax only
    #[token("->")]
    Arrow,
    #[token("?")]
    Question,
    #[token("|")]
    Pipe,
    #[token("&")]
    Ampersand,

    // ========== Delimiters ==========
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token("::")]
    ColonColon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    // ========== Special ==========
    /// End of input (added by the driver)
    Eof,

    /// Unrecognised input
    Error,
}

impl TokenKind {
    #[must_use]
    pub const fn is_keyword(&self) -> bool {
        matches!(
            self,
            Self::And
                | Self::Break
                | Self::Do
                | Self::Else
                | Self::Elseif
                | Self::End
                | Self::False
                | Self::For
                | Self::Function
                | Self::If
                | Self::In
                | Self::Local
                | Self::Nil
                | Self::Not
                | Self::Or
                | Self::Repeat
                | Self::Return
                | Self::Then
                | Self::True
                | Self::Until
                | Self::While
        )
    }

    /// Tokens that terminate a block
    #[must_use]
    pub const fn closes_block(&self) -> bool {
        matches!(
            self,
            Self::End | Self::Else | Self::Elseif | Self::Until | Self::Eof
        )
    }

    /// Compound assignment operators (`+=` and friends)
    #[must_use]
    pub const fn is_compound_assign(&self) -> bool {
        matches!(
            self,
            Self::PlusAssign
                | Self::MinusAssign
                | Self::StarAssign
                | Self::SlashAssign
                | Self::SlashSlashAssign
                | Self::PercentAssign
                | Self::CaretAssign
                | Self::DotDotAssign
        )
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::And => "'and'",
            Self::Break => "'break'",
            Self::Do => "'do'",
            Self::Else => "'else'",
            Self::Elseif => "'elseif'",
            Self::End => "'end'",
            Self::False => "'false'",
            Self::For => "'for'",
            Self::Function => "'function'",
            Self::If => "'if'",
            Self::In => "'in'",
            Self::Local => "'local'",
            Self::Nil => "'nil'",
            Self::Not => "'not'",
            Self::Or => "'or'",
            Self::Repeat => "'repeat'",
            Self::Return => "'return'",
            Self::Then => "'then'",
            Self::True => "'true'",
            Self::Until => "'until'",
            Self::While => "'while'",
            Self::Name => "identifier",
            Self::Number | Self::HexNumber | Self::BinaryNumber => "number",
            Self::QuotedString | Self::LongString => "string",
            Self::InterpStart | Self::InterpEnd => "'`'",
            Self::InterpText => "string",
            Self::InterpOpen => "'{'",
            Self::InterpClose => "'}'",
            Self::Plus => "'+'",
            Self::Minus => "'-'",
            Self::Star => "'*'",
            Self::Slash => "'/'",
            Self::SlashSlash => "'//'",
            Self::Percent => "'%'",
            Self::Caret => "'^'",
            Self::Hash => "'#'",
            Self::DotDot => "'..'",
            Self::Ellipsis => "'...'",
            Self::EqEq => "'=='",
            Self::NotEq => "'~='",
            Self::Lt => "'<'",
            Self::LtEq => "'<='",
            Self::Gt => "'>'",
            Self::GtEq => "'>='",
            Self::Assign => "'='",
            Self::PlusAssign => "'+='",
            Self::MinusAssign => "'-='",
            Self::StarAssign => "'*='",
            Self::SlashAssign => "'/='",
            Self::SlashSlashAssign => "'//='",
            Self::PercentAssign => "'%='",
            Self::CaretAssign => "'^='",
            Self::DotDotAssign => "'..='",
            Self::Arrow => "'->'",
            Self::Question => "'?'",
            Self::Pipe => "'|'",
            Self::Ampersand => "'&'",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::LBrace => "'{'",
            Self::RBrace => "'}'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::Semicolon => "';'",
            Self::Colon => "':'",
            Self::ColonColon => "'::'",
            Self::Comma => "','",
            Self::Dot => "'.'",
            Self::Eof => "<eof>",
            Self::Error => "invalid token",
        };
        f.write_str(text)
    }
}
