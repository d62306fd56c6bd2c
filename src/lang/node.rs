use serde::{Deserialize, Serialize};

/// 1-based source position of a node, as reported by the front end.
///
/// A default span (`0:0`) means the front end did not supply one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// ───────────────────────────── Registers ─────────────────────────────

/// Which bank a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterCategory {
    /// `l0`..`l15`, private to the function.
    Local,
    /// `p0`..`p15`, written by the caller before `call`.
    Param,
    /// `o0`..`o15`, the next callee's parameters and, after the call, its results.
    OutgoingParam,
    /// `r0`..`r15`, the function's results. Shares addresses with `Param`.
    Return,
    /// `g0`.., no window translation.
    Global,
}

/// A register reference: category plus a small id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Register {
    pub category: RegisterCategory,
    pub id: u8,
}

impl Register {
    pub fn new(category: RegisterCategory, id: u8) -> Self {
        Self { category, id }
    }

    pub fn local(id: u8) -> Self {
        Self::new(RegisterCategory::Local, id)
    }

    pub fn param(id: u8) -> Self {
        Self::new(RegisterCategory::Param, id)
    }

    pub fn outgoing(id: u8) -> Self {
        Self::new(RegisterCategory::OutgoingParam, id)
    }

    pub fn ret(id: u8) -> Self {
        Self::new(RegisterCategory::Return, id)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.category {
            RegisterCategory::Local => "l",
            RegisterCategory::Param => "p",
            RegisterCategory::OutgoingParam => "o",
            RegisterCategory::Return => "r",
            RegisterCategory::Global => "g",
        };
        write!(f, "{}{}", prefix, self.id)
    }
}

// ─────────────────────────────── Types ───────────────────────────────

/// The type a register or field can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegisterType {
    Long,
    Double,
    Ptr(Box<ObjectType>),
}

impl RegisterType {
    /// Kind-level comparison: any two pointers are compatible regardless of
    /// what they point at.
    pub fn same_kind(&self, other: &RegisterType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Anything that can be boxed with `make`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectType {
    Long,
    Double,
    Ptr(Box<ObjectType>),
    /// A user-declared type, by name.
    Named(String),
}

impl ObjectType {
    /// Symbol-table name of a boxed primitive (`long`, `double`, `ptr<long>`, ...).
    /// User types box under their own name and are not covered here.
    pub fn box_name(&self) -> String {
        match self {
            ObjectType::Long => "long".to_string(),
            ObjectType::Double => "double".to_string(),
            ObjectType::Ptr(inner) => format!("ptr<{}>", inner.box_name()),
            ObjectType::Named(name) => name.clone(),
        }
    }
}

// ──────────────────────────── Arguments ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Immediate {
    Int(i64),
    Float(f64),
}

/// Operand of an instruction: a register or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Reg(Register),
    Imm(Immediate),
}

impl Arg {
    pub fn int(value: i64) -> Self {
        Arg::Imm(Immediate::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Arg::Imm(Immediate::Float(value))
    }
}

impl From<Register> for Arg {
    fn from(reg: Register) -> Self {
        Arg::Reg(reg)
    }
}

impl std::fmt::Display for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Reg(reg) => write!(f, "{}", reg),
            Arg::Imm(Immediate::Int(v)) => write!(f, "{}", v),
            Arg::Imm(Immediate::Float(v)) => write!(f, "{:?}", v),
        }
    }
}

/// `obj.Type:field`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub obj: Register,
    pub type_name: String,
    pub field: String,
}

impl Member {
    pub fn new(obj: Register, type_name: &str, field: &str) -> Self {
        Self {
            obj,
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    /// Compound symbol-table key, `Type:field`.
    pub fn symbol(&self) -> String {
        format!("{}:{}", self.type_name, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrowLhs {
    Reg(Register),
    Member(Member),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrowRhs {
    Reg(Register),
    Member(Member),
    Make(ObjectType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemoryLocation {
    Reg(Register),
    Member(Member),
}

// ──────────────────────────── Operators ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoArgOp {
    Trap,
    Ret,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoRetOp {
    Print,
    PrintChar,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation, `-x`.
    ANeg,
    /// Bitwise complement, `~x`.
    BNeg,
    /// Logical not, `!x`.
    LNeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Sll,
    Srl,
    Sra,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOp {
    Load,
    Store,
}

// ─────────────────────────── Instructions ────────────────────────────

/// One `elif` arm of an `if`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elif {
    pub condition: Arg,
    pub body: Vec<Node>,
}

/// Instruction node of a function, constructor or destructor body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default)]
    pub span: Span,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            span: Span::default(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl From<NodeKind> for Node {
    fn from(kind: NodeKind) -> Self {
        Node::new(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// `lhs <- rhs`: move or construct into a register or field.
    ///
    /// A register destination releases the value it held before.
    Arrow { lhs: ArrowLhs, rhs: ArrowRhs },

    /// `call name`
    Call { name: String },

    /// `trap`, `ret`, `break`, `continue`
    NoArg(NoArgOp),

    /// `print arg`, `printc arg`, `exit arg`
    NoRet { op: NoRetOp, arg: Arg },

    /// `dst <- op arg`
    Unary { op: UnaryOp, dst: Register, arg: Arg },

    /// `dst <- op lhs, rhs`
    Binary {
        op: BinaryOp,
        dst: Register,
        lhs: Arg,
        rhs: Arg,
    },

    /// `load reg, location` / `store reg, location`
    Memory {
        op: MemoryOp,
        reg: Register,
        location: MemoryLocation,
    },

    /// `if cond { .. } elif cond { .. } else { .. }`
    If {
        condition: Arg,
        body: Vec<Node>,
        elifs: Vec<Elif>,
        else_body: Option<Vec<Node>>,
    },

    /// `while cond { .. }`
    While { condition: Arg, body: Vec<Node> },
}

impl NodeKind {
    /// Short human-readable name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Arrow { .. } => "arrow",
            NodeKind::Call { .. } => "call",
            NodeKind::NoArg(NoArgOp::Trap) => "trap",
            NodeKind::NoArg(NoArgOp::Ret) => "ret",
            NodeKind::NoArg(NoArgOp::Break) => "break",
            NodeKind::NoArg(NoArgOp::Continue) => "continue",
            NodeKind::NoRet { op: NoRetOp::Print, .. } => "print",
            NodeKind::NoRet { op: NoRetOp::PrintChar, .. } => "printc",
            NodeKind::NoRet { op: NoRetOp::Exit, .. } => "exit",
            NodeKind::Unary { .. } => "unary",
            NodeKind::Binary { .. } => "binary",
            NodeKind::Memory { op: MemoryOp::Load, .. } => "load",
            NodeKind::Memory { op: MemoryOp::Store, .. } => "store",
            NodeKind::If { .. } => "if",
            NodeKind::While { .. } => "while",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_names() {
        assert_eq!(ObjectType::Long.box_name(), "long");
        let nested = ObjectType::Ptr(Box::new(ObjectType::Ptr(Box::new(ObjectType::Double))));
        assert_eq!(nested.box_name(), "ptr<ptr<double>>");
    }

    #[test]
    fn test_pointer_types_compare_by_kind() {
        let a = RegisterType::Ptr(Box::new(ObjectType::Named("A".to_string())));
        let b = RegisterType::Ptr(Box::new(ObjectType::Long));
        assert!(a.same_kind(&b));
        assert!(!a.same_kind(&RegisterType::Long));
    }

    #[test]
    fn test_register_display() {
        assert_eq!(Register::outgoing(3).to_string(), "o3");
        assert_eq!(Register::ret(0).to_string(), "r0");
        assert_eq!(Arg::float(2.0).to_string(), "2.0");
        assert_eq!(Arg::int(-4).to_string(), "-4");
    }

    #[test]
    fn test_node_json_defaults_span() {
        let json = r#"{"kind":{"NoArg":"Ret"}}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.kind, NodeKind::NoArg(NoArgOp::Ret));
        assert_eq!(node.span, Span::default());
    }
}
