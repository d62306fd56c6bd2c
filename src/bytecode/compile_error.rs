use crate::lang::node::Span;

/// What went wrong while lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoweringErrorKind {
    /// A call, type or field name that the symbol table doesn't know, or
    /// that names the wrong kind of thing.
    #[error("unknown symbol")]
    UnknownSymbol,
    /// Two definitions under one name, or a definition shadowing a primitive.
    #[error("duplicate definition")]
    DuplicateDefinition,
    /// Operands whose tracked types don't agree.
    #[error("type mismatch")]
    TypeMismatch,
    /// A node shape the emitter has no lowering for.
    #[error("unsupported node")]
    UnsupportedNode,
    /// A value that doesn't fit the signed 8-bit instruction parameter.
    #[error("operand out of range")]
    OperandOutOfRange,
}

/// A lowering-time semantic error, located at the offending node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{span}: {kind}: {message}{}", hint_suffix(.hint))]
pub struct LoweringError {
    pub kind: LoweringErrorKind,
    pub message: String,
    pub span: Span,
    pub hint: Option<String>,
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl LoweringError {
    pub fn new(kind: LoweringErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn unknown_symbol(name: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::UnknownSymbol,
            format!("'{}' is not defined", name),
            span,
        )
    }

    /// `name` resolved, but not to the kind of symbol the node needs.
    pub fn wrong_symbol(name: &str, expected: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::UnknownSymbol,
            format!("'{}' is not a {}", name, expected),
            span,
        )
    }

    pub fn duplicate(name: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::DuplicateDefinition,
            format!("'{}' is already defined", name),
            span,
        )
    }

    pub fn primitive_redefinition(name: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::DuplicateDefinition,
            format!("cannot redefine primitive type '{}'", name),
            span,
        )
        .with_hint("long, double and ptr are reserved")
    }

    pub fn type_mismatch(lhs: &str, rhs: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::TypeMismatch,
            format!("operands {} and {} have different types", lhs, rhs),
            span,
        )
    }

    pub fn unsupported(node: &str, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::UnsupportedNode,
            format!("cannot lower '{}'", node),
            span,
        )
    }

    pub fn float_immediate(value: f64, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::UnsupportedNode,
            format!("floating-point immediate {} has no constant-pool encoding", value),
            span,
        )
        .with_hint("constant pools hold 64-bit integers only")
    }

    pub fn out_of_range(what: &str, value: i64, span: Span) -> Self {
        Self::new(
            LoweringErrorKind::OperandOutOfRange,
            format!("{} {} does not fit a signed byte", what, value),
            span,
        )
    }
}
