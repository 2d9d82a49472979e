use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODE - Bytecode instruction tags
// =============================================================================

/// Instruction tag. The numeric value is the first word of the instruction.
///
/// Stack effects are written as `( before -- after )`. Condition opcodes take
/// `then-length, else-length` operands followed by both bodies; the lengths
/// are relative to the word after the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    // stack manipulation
    /// `PUSH c` ( -- consts[c] )
    Push = 0,
    /// ( -- pos )
    PushCurrPos = 1,
    /// ( x -- )
    Pop = 2,
    /// ( pos -- ), restores the input position
    PopCurrPos = 3,
    /// `POP_N n` ( x1..xn -- )
    PopN = 4,
    /// ( a b -- b )
    Nip = 5,
    /// ( arr x -- arr' )
    Append = 6,
    /// `WRAP n` ( x1..xn -- [x1..xn] )
    Wrap = 7,
    /// ( pos x -- pos text ), text runs from pos to the current position
    Text = 8,

    // conditions and loops
    /// Tests truthiness of the top value.
    If = 9,
    IfError = 10,
    IfNotError = 11,
    /// ( arr min -- arr ), then-branch when `arr.len() < min`
    IfArrlenMin = 12,
    /// ( arr max -- arr ), then-branch when `arr.len() >= max`
    IfArrlenMax = 13,
    /// `WHILE_NOT_ERROR b`: repeats the body while the top is not FAILED
    WhileNotError = 14,

    // matching
    MatchAny = 15,
    /// `MATCH_STRING s, t, f`
    MatchString = 16,
    /// `MATCH_STRING_IC s, t, f`; `consts[s]` is already lower-cased
    MatchStringIc = 17,
    /// `MATCH_REGEXP c, t, f`; `consts[c]` is a character class
    MatchRegexp = 18,
    /// `ACCEPT_N n` ( -- text ), advances n characters
    AcceptN = 19,
    /// `ACCEPT_STRING s` ( -- consts[s] ), advances by its length
    AcceptString = 20,
    /// `FAIL e` ( -- FAILED ), records expectation `consts[e]`
    Fail = 21,

    // calls
    /// `REPORT_SAVED_POS p`: reported position = stack[top - p]
    ReportSavedPos = 22,
    ReportCurrPos = 23,
    /// `CALL f, n, pc, p1..pc`: calls `consts[f]` with stack[top - pi],
    /// then pops n values and pushes the result
    Call = 24,

    // rules
    /// `RULE r` ( -- value )
    Rule = 25,

    // failure reporting
    SilentFailsOn = 26,
    SilentFailsOff = 27,
}

/// How the words after an opcode are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// A fixed number of plain operands.
    Plain(usize),
    /// `leading` operands, then then-length and else-length, then the bodies.
    Condition { leading: usize },
    /// Body length, then the body.
    Loop,
    /// `f, n, pc` then `pc` parameter slots.
    Call,
}

impl Opcode {
    pub const ALL: [Opcode; 28] = [
        Opcode::Push,
        Opcode::PushCurrPos,
        Opcode::Pop,
        Opcode::PopCurrPos,
        Opcode::PopN,
        Opcode::Nip,
        Opcode::Append,
        Opcode::Wrap,
        Opcode::Text,
        Opcode::If,
        Opcode::IfError,
        Opcode::IfNotError,
        Opcode::IfArrlenMin,
        Opcode::IfArrlenMax,
        Opcode::WhileNotError,
        Opcode::MatchAny,
        Opcode::MatchString,
        Opcode::MatchStringIc,
        Opcode::MatchRegexp,
        Opcode::AcceptN,
        Opcode::AcceptString,
        Opcode::Fail,
        Opcode::ReportSavedPos,
        Opcode::ReportCurrPos,
        Opcode::Call,
        Opcode::Rule,
        Opcode::SilentFailsOn,
        Opcode::SilentFailsOff,
    ];

    pub fn from_u32(word: u32) -> Option<Opcode> {
        Self::ALL.get(word as usize).copied()
    }

    pub fn word(self) -> u32 {
        self as u32
    }

    pub fn shape(self) -> Shape {
        use Opcode::*;
        match self {
            PushCurrPos | Pop | PopCurrPos | Nip | Append | Text | ReportCurrPos
            | SilentFailsOn | SilentFailsOff => Shape::Plain(0),
            Push | PopN | Wrap | AcceptN | AcceptString | Fail | ReportSavedPos | Rule => {
                Shape::Plain(1)
            }
            If | IfError | IfNotError | IfArrlenMin | IfArrlenMax | MatchAny => {
                Shape::Condition { leading: 0 }
            }
            MatchString | MatchStringIc | MatchRegexp => Shape::Condition { leading: 1 },
            WhileNotError => Shape::Loop,
            Call => Shape::Call,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Push => "PUSH",
            PushCurrPos => "PUSH_CURR_POS",
            Pop => "POP",
            PopCurrPos => "POP_CURR_POS",
            PopN => "POP_N",
            Nip => "NIP",
            Append => "APPEND",
            Wrap => "WRAP",
            Text => "TEXT",
            If => "IF",
            IfError => "IF_ERROR",
            IfNotError => "IF_NOT_ERROR",
            IfArrlenMin => "IF_ARRLEN_MIN",
            IfArrlenMax => "IF_ARRLEN_MAX",
            WhileNotError => "WHILE_NOT_ERROR",
            MatchAny => "MATCH_ANY",
            MatchString => "MATCH_STRING",
            MatchStringIc => "MATCH_STRING_IC",
            MatchRegexp => "MATCH_REGEXP",
            AcceptN => "ACCEPT_N",
            AcceptString => "ACCEPT_STRING",
            Fail => "FAIL",
            ReportSavedPos => "REPORT_SAVED_POS",
            ReportCurrPos => "REPORT_CURR_POS",
            Call => "CALL",
            Rule => "RULE",
            SilentFailsOn => "SILENT_FAILS_ON",
            SilentFailsOff => "SILENT_FAILS_OFF",
        }
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op.word()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
