//! Bytecode instruction set for the corvid virtual machine

/// Result count meaning "all of them"; recorded in the frame's pending multi count
pub const MULTI: u8 = 255;

/// Bytecode operation codes
///
/// This is a stack-based instruction set. Operands follow the opcode byte in
/// little-endian order; jump offsets are always the last operand and are
/// relative to the start of the next instruction.
///
/// Slot operands are relative to the frame base, where slot 0 holds the
/// running closure and slots 1.. hold parameters and locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ===== Stack Operations =====
    /// Push nil
    Nil,
    True,
    False,
    /// Push a constant. Operand: u16 constant index
    Const,
    Pop,
    /// Operand: u8 count
    PopN,
    Dup,
    /// Push a copy of the value `depth` slots below the top. Operand: u8 depth
    Pick,

    // ===== Variables =====
    /// Operand: u8 slot
    GetLocal,
    /// Pop into a local. Operand: u8 slot
    SetLocal,
    /// Operand: u8 upvalue index
    GetUpvalue,
    /// Pop into an upvalue. Operand: u8 upvalue index
    SetUpvalue,
    /// Close open upvalues at or above a slot. Operand: u8 slot
    Close,
    /// Operand: u16 constant index (name)
    GetGlobal,
    /// Pop into a global. Operand: u16 constant index (name)
    SetGlobal,

    // ===== Tables =====
    /// Operands: u16 array size hint, u16 hash size hint
    NewTable,
    /// `[t k] -> [v]`
    GetIndex,
    /// `[t k v] -> []`
    SetIndex,
    /// `[t] -> [v]`. Operand: u16 constant index (name)
    GetField,
    /// `[t v] -> []`. Operand: u16 constant index (name)
    SetField,
    /// Constructor store that keeps the table. `[t v] -> [t]`. Operand: u16 name
    InitField,
    /// Constructor store that keeps the table. `[t k v] -> [t]`
    InitIndex,
    /// Store positional constructor values. `[t v1..vn] -> [t]`.
    /// Operands: u8 count, u8 multi flag, u32 first array index
    SetList,
    /// Method lookup. `[o] -> [o.name o]`. Operand: u16 constant index (name)
    SelfOp,

    // ===== Arithmetic and Logic =====
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    /// Concatenate the top n values. Operand: u8 n
    Concat,
    /// Convert the top value to a string the way `tostring` does
    ToStr,

    // ===== Comparison =====
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // ===== Control Flow =====
    /// Operand: i16 offset
    Jump,
    /// Pop; jump when falsy. Operand: i16 offset
    JumpIfFalse,
    /// Pop; jump when truthy. Operand: i16 offset
    JumpIfTrue,
    /// Jump keeping the value when falsy, otherwise pop (`and`). Operand: i16 offset
    JumpIfFalseOrPop,
    /// Jump keeping the value when truthy, otherwise pop (`or`). Operand: i16 offset
    JumpIfTrueOrPop,

    // ===== Functions =====
    /// `[f a1..an] -> [r1..rm]`. Operands: u8 argc, u8 multi flag, u8 results (255 = all)
    Call,
    /// Operands: u8 count, u8 multi flag
    Return,
    /// Operand: u16 child prototype index, then one (u8 is_local, u8 index) pair per upvalue
    Closure,
    /// Push varargs. Operand: u8 count (255 = all)
    VarArg,

    // ===== Loops =====
    /// Validate a numeric loop and skip it when empty. Operands: u8 base slot, i16 exit offset
    ForPrep,
    /// Step a numeric loop. Operands: u8 base slot, i16 body offset
    ForLoop,
    /// Resolve generalized iteration. Operand: u8 base slot
    ForInPrep,
    /// Call the iterator. Operands: u8 base slot, u8 variable count
    ForInCall,
    /// Stop on nil or store the control value. Operands: u8 base slot, u8 variable count, i16 exit offset
    ForInLoop,
}

impl OpCode {
    /// Size of the instruction including operands.
    ///
    /// `Closure` is followed by two bytes per captured upvalue that this size
    /// does not include.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Dup
            | OpCode::GetIndex
            | OpCode::SetIndex
            | OpCode::InitIndex
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Unm
            | OpCode::Not
            | OpCode::Len
            | OpCode::ToStr
            | OpCode::Eq
            | OpCode::Ne
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Gt
            | OpCode::Ge => 1,

            OpCode::PopN
            | OpCode::Pick
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Close
            | OpCode::Concat
            | OpCode::VarArg
            | OpCode::ForInPrep => 2,

            OpCode::Const
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetField
            | OpCode::SetField
            | OpCode::InitField
            | OpCode::SelfOp
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::JumpIfFalseOrPop
            | OpCode::JumpIfTrueOrPop
            | OpCode::Return
            | OpCode::Closure
            | OpCode::ForInCall => 3,

            OpCode::Call | OpCode::ForPrep | OpCode::ForLoop => 4,

            OpCode::NewTable | OpCode::ForInLoop => 5,

            OpCode::SetList => 7,
        }
    }

    /// Whether the last operand is an i16 jump offset
    #[must_use]
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::JumpIfTrue
                | OpCode::JumpIfFalseOrPop
                | OpCode::JumpIfTrueOrPop
                | OpCode::ForPrep
                | OpCode::ForLoop
                | OpCode::ForInLoop
        )
    }

    /// Whether the first operand is a u16 constant index
    #[must_use]
    pub const fn uses_constant(self) -> bool {
        matches!(
            self,
            OpCode::Const
                | OpCode::GetGlobal
                | OpCode::SetGlobal
                | OpCode::GetField
                | OpCode::SetField
                | OpCode::InitField
                | OpCode::SelfOp
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Const => "CONST",
            OpCode::Pop => "POP",
            OpCode::PopN => "POPN",
            OpCode::Dup => "DUP",
            OpCode::Pick => "PICK",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::Close => "CLOSE",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::NewTable => "NEW_TABLE",
            OpCode::GetIndex => "GET_INDEX",
            OpCode::SetIndex => "SET_INDEX",
            OpCode::GetField => "GET_FIELD",
            OpCode::SetField => "SET_FIELD",
            OpCode::InitField => "INIT_FIELD",
            OpCode::InitIndex => "INIT_INDEX",
            OpCode::SetList => "SET_LIST",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::ToStr => "TOSTR",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Gt => "GT",
            OpCode::Ge => "GE",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            OpCode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::ForPrep => "FOR_PREP",
            OpCode::ForLoop => "FOR_LOOP",
            OpCode::ForInPrep => "FORIN_PREP",
            OpCode::ForInCall => "FORIN_CALL",
            OpCode::ForInLoop => "FORIN_LOOP",
        }
    }

    /// Every opcode in discriminant order
    pub const ALL: [OpCode; 56] = [
        OpCode::Nil,
        OpCode::True,
        OpCode::False,
        OpCode::Const,
        OpCode::Pop,
        OpCode::PopN,
        OpCode::Dup,
        OpCode::Pick,
        OpCode::GetLocal,
        OpCode::SetLocal,
        OpCode::GetUpvalue,
        OpCode::SetUpvalue,
        OpCode::Close,
        OpCode::GetGlobal,
        OpCode::SetGlobal,
        OpCode::NewTable,
        OpCode::GetIndex,
        OpCode::SetIndex,
        OpCode::GetField,
        OpCode::SetField,
        OpCode::InitField,
        OpCode::InitIndex,
        OpCode::SetList,
        OpCode::SelfOp,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::IDiv,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Unm,
        OpCode::Not,
        OpCode::Len,
        OpCode::Concat,
        OpCode::ToStr,
        OpCode::Eq,
        OpCode::Ne,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Gt,
        OpCode::Ge,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::JumpIfTrue,
        OpCode::JumpIfFalseOrPop,
        OpCode::JumpIfTrueOrPop,
        OpCode::Call,
        OpCode::Return,
        OpCode::Closure,
        OpCode::VarArg,
        OpCode::ForPrep,
        OpCode::ForLoop,
        OpCode::ForInPrep,
        OpCode::ForInCall,
        OpCode::ForInLoop,
    ];

    /// Number of distinct opcodes
    pub const COUNT: usize = OpCode::ForInLoop as usize + 1;
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let index = value as usize;
        if index < OpCode::COUNT {
            Ok(OpCode::ALL[index])
        } else {
            Err(value)
        }
    }
}
