use serde::{Deserialize, Serialize};

use super::node::{Node, RegisterType, Span};

/// Program tree handed over by the front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Top-level statements, in source order.
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Function(Function),
    Type(TypeDef),
}

/// `fn name(params) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Types of `p0`, `p1`, ... in order.
    pub params: Vec<RegisterType>,
    pub body: Vec<Node>,
    #[serde(default)]
    pub span: Span,
}

impl Function {
    pub fn new(name: &str, params: Vec<RegisterType>, body: Vec<Node>) -> Self {
        Self {
            name: name.to_string(),
            params,
            body,
            span: Span::default(),
        }
    }
}

/// `type Name { fields; ctor; dtor }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub ctor: Option<Ctor>,
    pub dtor: Option<Dtor>,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub span: Span,
}

/// Constructor. `p0` is the object being built; declared params follow as `p1`...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ctor {
    pub params: Vec<RegisterType>,
    pub body: Vec<Node>,
    #[serde(default)]
    pub span: Span,
}

/// Destructor. Its only parameter, `p0`, is the object being destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dtor {
    pub body: Vec<Node>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: RegisterType,
    #[serde(default)]
    pub span: Span,
}

impl Field {
    pub fn new(name: &str, ty: RegisterType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            span: Span::default(),
        }
    }
}
