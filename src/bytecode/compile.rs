use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{
    bytecode::{
        Instruction, Opcode,
        compile_error::{LoweringError, LoweringErrorKind},
        context::ScopeStack,
        ir::{Chunk, ChunkId, ClassId, ClassRecord, Executable, FieldId, Symbol, VALUE_WIDTH, ValueKind},
        register::{in_bank, translate},
    },
    lang::{
        node::{
            Arg, ArrowLhs, ArrowRhs, BinaryOp, Elif, Immediate, Member, MemoryLocation, MemoryOp,
            Node, NodeKind, NoArgOp, NoRetOp, ObjectType, Register, RegisterCategory,
            RegisterType, Span, UnaryOp,
        },
        program::{Function, Program, Statement, TypeDef},
    },
};

/// Names that user functions and types may not take.
const PRIMITIVES: [&str; 3] = ["long", "double", "ptr"];

/// Registers per windowed bank; also the cap on declared parameters.
const BANK_SIZE: usize = 16;

/// Largest step a single bias instruction can move a window by.
const MAX_BIAS: usize = i8::MAX as usize;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Reject operands whose tracked types disagree. When off, the mismatch
    /// is logged and lowering continues.
    pub strict_types: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig { strict_types: true }
    }
}

pub struct Compiler {
    /// Output executable, filled in over both passes
    exe: Executable,

    config: CompilerConfig,

    /// Declared type of each `Type:field`
    field_types: HashMap<String, RegisterType>,
}

/// Jump sites of the innermost enclosing `while`.
struct LoopLabels {
    header: usize,
    breaks: Vec<usize>,
}

/// Emission state for one chunk being lowered.
struct Body {
    chunk: Chunk,
    ctx: ScopeStack,
    loops: Vec<LoopLabels>,
}

impl Body {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            ctx: ScopeStack::new(),
            loops: Vec::new(),
        }
    }

    /// Position the next instruction will be emitted at.
    fn here(&self) -> usize {
        self.chunk.code.len()
    }

    fn emit(&mut self, op: Opcode, param: i8) -> usize {
        self.chunk.code.push(Instruction::new(op, param));
        self.chunk.code.len() - 1
    }

    fn emit_bare(&mut self, op: Opcode) -> usize {
        self.emit(op, 0)
    }

    /// Point the placeholder jump at `at` to `target`.
    fn patch(&mut self, at: usize, target: usize, span: Span) -> Result<(), LoweringError> {
        self.chunk.code[at].param = displacement(at, target, span)?;
        Ok(())
    }

    fn load(&mut self, reg: Register, span: Span) -> Result<(), LoweringError> {
        let slot = slot_of(reg, span)?;
        match reg.category {
            RegisterCategory::Global => self.emit(Opcode::LoadGlobal, slot),
            _ => self.emit(Opcode::LoadAuxiliary, slot),
        };
        Ok(())
    }

    fn store(&mut self, reg: Register, span: Span) -> Result<(), LoweringError> {
        let slot = slot_of(reg, span)?;
        match reg.category {
            RegisterCategory::Global => self.emit(Opcode::StoreGlobal, slot),
            _ => self.emit(Opcode::StoreAuxiliary, slot),
        };
        Ok(())
    }

    /// Push the register's value and leave zero behind.
    fn take(&mut self, reg: Register, span: Span) -> Result<(), LoweringError> {
        let slot = slot_of(reg, span)?;
        match reg.category {
            RegisterCategory::Global => {
                self.emit(Opcode::LoadGlobal, slot);
                self.emit(Opcode::ImmByte, 0);
                self.emit(Opcode::StoreGlobal, slot);
            }
            _ => {
                self.emit(Opcode::MoveAuxiliary, slot);
            }
        }
        Ok(())
    }

    /// Push `value` from the constant pool, adding it on first use.
    ///
    /// Indices past what one parameter byte reaches are bracketed by
    /// window biases that are undone right after the load.
    fn constant(&mut self, value: i64) {
        let index = match self.ctx.constant_index(value) {
            Some(index) => index,
            None => {
                let index = self.chunk.constants.len();
                self.chunk.constants.push(value);
                self.ctx.insert_constant(value, index);
                index
            }
        };

        let mut offset = index;
        let mut biased = 0;
        while offset > MAX_BIAS {
            self.emit(Opcode::BiasConstantWindow, i8::MAX);
            offset -= MAX_BIAS;
            biased += MAX_BIAS;
        }
        self.emit(Opcode::Constant, offset as i8);
        while biased > 0 {
            let step = biased.min(MAX_BIAS);
            self.emit(Opcode::BiasConstantWindow, -(step as i8));
            biased -= step;
        }
    }

    /// Push a small non-negative number, from the parameter byte when it fits.
    fn small(&mut self, value: usize) {
        match i8::try_from(value) {
            Ok(param) => {
                self.emit(Opcode::ImmByte, param);
            }
            Err(_) => self.constant(value as i64),
        }
    }
}

fn displacement(from: usize, to: usize, span: Span) -> Result<i8, LoweringError> {
    let distance = to as i64 - from as i64;
    i8::try_from(distance).map_err(|_| LoweringError::out_of_range("jump displacement", distance, span))
}

fn slot_of(reg: Register, span: Span) -> Result<i8, LoweringError> {
    if !in_bank(reg) {
        return Err(LoweringError::new(
            LoweringErrorKind::OperandOutOfRange,
            format!("register {} is outside its bank", reg),
            span,
        ));
    }
    Ok(translate(reg) as i8)
}

fn value_kind(ty: &RegisterType) -> ValueKind {
    match ty {
        RegisterType::Long => ValueKind::Long,
        RegisterType::Double => ValueKind::Double,
        RegisterType::Ptr(_) => ValueKind::DataPtr,
    }
}

/// Type of the value a pointer of type `ty` points at, when it's a register type.
fn pointee(ty: Option<&RegisterType>) -> Option<RegisterType> {
    match ty {
        Some(RegisterType::Ptr(inner)) => match inner.as_ref() {
            ObjectType::Long => Some(RegisterType::Long),
            ObjectType::Double => Some(RegisterType::Double),
            ObjectType::Ptr(target) => Some(RegisterType::Ptr(target.clone())),
            ObjectType::Named(_) => None,
        },
        _ => None,
    }
}

fn imm_matches(ty: &RegisterType, imm: &Immediate) -> bool {
    matches!(
        (ty, imm),
        (RegisterType::Long, Immediate::Int(_)) | (RegisterType::Double, Immediate::Float(_))
    )
}

fn binary_opcode(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Add => Opcode::AddLong,
        BinaryOp::Sub => Opcode::SubLong,
        BinaryOp::Mul => Opcode::MulLong,
        BinaryOp::Div => Opcode::IDivLong,
        BinaryOp::Mod => Opcode::ModuloLong,
        BinaryOp::Sll => Opcode::LeftShiftLong,
        BinaryOp::Srl => Opcode::RightShiftLogicalLong,
        BinaryOp::Sra => Opcode::RightShiftArithmeticLong,
        BinaryOp::And => Opcode::LogicalAndLong,
        BinaryOp::Or => Opcode::LogicalOrLong,
        BinaryOp::Xor => return None,
    })
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::ANeg => Opcode::ArithmeticNeg,
        UnaryOp::BNeg => Opcode::BinaryNeg,
        UnaryOp::LNeg => Opcode::LogicalNeg,
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_config(CompilerConfig::default())
    }

    pub fn with_config(config: CompilerConfig) -> Self {
        Self {
            exe: Executable::new(),
            config,
            field_types: HashMap::new(),
        }
    }

    /// Lower a whole program: bind every name first, then emit each body.
    pub fn compile_program(mut self, program: &Program) -> Result<Executable, LoweringError> {
        self.discover(program)?;

        for statement in &program.statements {
            match statement {
                Statement::Function(func) => self.lower_function(func)?,
                Statement::Type(def) => self.lower_type(def)?,
            }
        }

        if let Some(Symbol::Chunk(main)) = self.exe.symbol("main") {
            self.exe.entry = main;
        }
        self.exe.relocate();

        debug!(
            chunks = self.exe.chunks.len(),
            classes = self.exe.classes.len(),
            entry = self.exe.entry.0,
            "lowered program"
        );
        Ok(self.exe)
    }

    // =========================================================================
    // Pass 1: symbol discovery
    // =========================================================================

    fn discover(&mut self, program: &Program) -> Result<(), LoweringError> {
        for statement in &program.statements {
            match statement {
                Statement::Function(func) => {
                    self.declare(&func.name, func.span)?;
                    let chunk = self.reserve_chunk();
                    self.exe.symbols.insert(func.name.clone(), Symbol::Chunk(chunk));
                    trace!(name = %func.name, chunk = chunk.0, "reserved function chunk");
                }
                Statement::Type(def) => self.discover_type(def)?,
            }
        }

        // Declared types may refer to types defined further down.
        for statement in &program.statements {
            match statement {
                Statement::Function(func) => {
                    for ty in &func.params {
                        self.check_declared(ty, func.span)?;
                    }
                }
                Statement::Type(def) => {
                    for field in &def.fields {
                        self.check_declared(&field.ty, field.span)?;
                    }
                    if let Some(ctor) = &def.ctor {
                        for ty in &ctor.params {
                            self.check_declared(ty, ctor.span)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn discover_type(&mut self, def: &TypeDef) -> Result<(), LoweringError> {
        self.declare(&def.name, def.span)?;

        let ctor = match def.ctor {
            Some(_) => self.reserve_chunk(),
            None => ChunkId(0),
        };
        let dtor = match def.dtor {
            Some(_) => self.reserve_chunk(),
            None => ChunkId(0),
        };

        let mut fields = Vec::with_capacity(def.fields.len());
        for (index, field) in def.fields.iter().enumerate() {
            let key = format!("{}:{}", def.name, field.name);
            if self.exe.symbols.contains_key(&key) {
                return Err(LoweringError::duplicate(&key, field.span));
            }
            self.exe.symbols.insert(key.clone(), Symbol::Field(FieldId(index)));
            self.field_types.insert(key, field.ty.clone());
            fields.push(value_kind(&field.ty));
        }

        let class = ClassId(self.exe.classes.len());
        self.exe.classes.push(ClassRecord {
            name: def.name.clone(),
            fields,
            ctor,
            dtor,
        });
        self.exe.symbols.insert(def.name.clone(), Symbol::Class(class));
        trace!(name = %def.name, class = class.0, ctor = ctor.0, dtor = dtor.0, "declared type");
        Ok(())
    }

    fn declare(&self, name: &str, span: Span) -> Result<(), LoweringError> {
        if PRIMITIVES.contains(&name) {
            return Err(LoweringError::primitive_redefinition(name, span));
        }
        if self.exe.symbols.contains_key(name) {
            return Err(LoweringError::duplicate(name, span));
        }
        Ok(())
    }

    fn reserve_chunk(&mut self) -> ChunkId {
        self.exe.chunks.push(Chunk::new());
        ChunkId(self.exe.chunks.len() - 1)
    }

    fn check_declared(&self, ty: &RegisterType, span: Span) -> Result<(), LoweringError> {
        match ty {
            RegisterType::Ptr(inner) => self.check_object(inner, span),
            _ => Ok(()),
        }
    }

    fn check_object(&self, ty: &ObjectType, span: Span) -> Result<(), LoweringError> {
        match ty {
            ObjectType::Named(name) => self.class_of(name, span).map(|_| ()),
            ObjectType::Ptr(inner) => self.check_object(inner, span),
            ObjectType::Long | ObjectType::Double => Ok(()),
        }
    }

    // =========================================================================
    // Symbol lookups
    // =========================================================================

    fn chunk_of(&self, name: &str, span: Span) -> Result<ChunkId, LoweringError> {
        match self.exe.symbol(name) {
            Some(Symbol::Chunk(chunk)) => Ok(chunk),
            Some(_) => Err(LoweringError::wrong_symbol(name, "function", span)),
            None => Err(LoweringError::unknown_symbol(name, span)),
        }
    }

    fn class_of(&self, name: &str, span: Span) -> Result<ClassId, LoweringError> {
        match self.exe.symbol(name) {
            Some(Symbol::Class(class)) => Ok(class),
            Some(_) => Err(LoweringError::wrong_symbol(name, "type", span)),
            None => Err(LoweringError::unknown_symbol(name, span)),
        }
    }

    fn field_of(&self, member: &Member, span: Span) -> Result<i8, LoweringError> {
        let key = member.symbol();
        match self.exe.symbol(&key) {
            Some(Symbol::Field(FieldId(index))) => i8::try_from(index)
                .map_err(|_| LoweringError::out_of_range("field index", index as i64, span)),
            Some(_) => Err(LoweringError::wrong_symbol(&key, "field", span)),
            None => Err(LoweringError::unknown_symbol(&key, span)),
        }
    }

    fn class_record(&self, class: ClassId) -> Option<&ClassRecord> {
        self.exe.classes.get(class.0)
    }

    // =========================================================================
    // Pass 2: code generation
    // =========================================================================

    fn lower_function(&mut self, func: &Function) -> Result<(), LoweringError> {
        let chunk = self.chunk_of(&func.name, func.span)?;
        self.lower_body(chunk, &func.params, &func.body, func.span)
    }

    fn lower_type(&mut self, def: &TypeDef) -> Result<(), LoweringError> {
        let class = self.class_of(&def.name, def.span)?;
        let (ctor_chunk, dtor_chunk) = match self.class_record(class) {
            Some(record) => (record.ctor, record.dtor),
            None => return Err(LoweringError::unknown_symbol(&def.name, def.span)),
        };
        let this = RegisterType::Ptr(Box::new(ObjectType::Named(def.name.clone())));

        if let Some(ctor) = &def.ctor {
            let mut params = vec![this.clone()];
            params.extend(ctor.params.iter().cloned());
            self.lower_body(ctor_chunk, &params, &ctor.body, ctor.span)?;
        }
        if let Some(dtor) = &def.dtor {
            self.lower_body(dtor_chunk, &[this], &dtor.body, dtor.span)?;
        }
        Ok(())
    }

    fn lower_body(
        &mut self,
        chunk: ChunkId,
        params: &[RegisterType],
        nodes: &[Node],
        span: Span,
    ) -> Result<(), LoweringError> {
        if params.len() > BANK_SIZE {
            return Err(LoweringError::out_of_range("parameter count", params.len() as i64, span));
        }

        let mut body = Body::new(std::mem::take(&mut self.exe.chunks[chunk.0]));
        for (id, ty) in params.iter().enumerate() {
            body.ctx.set_reg_type(Register::param(id as u8), Some(ty.clone()));
        }

        self.lower_nodes(&mut body, nodes)?;

        debug!(
            chunk = chunk.0,
            code = body.chunk.code.len(),
            constants = body.chunk.constants.len(),
            "lowered chunk"
        );
        self.exe.chunks[chunk.0] = body.chunk;
        Ok(())
    }

    fn lower_nodes(&mut self, body: &mut Body, nodes: &[Node]) -> Result<(), LoweringError> {
        for node in nodes {
            self.lower_node(body, node)?;
        }
        Ok(())
    }

    /// Lower `nodes` in a fresh nested scope.
    fn lower_scoped(&mut self, body: &mut Body, nodes: &[Node]) -> Result<(), LoweringError> {
        body.ctx.push_scope();
        let lowered = self.lower_nodes(body, nodes);
        body.ctx.pop_scope();
        lowered
    }

    fn lower_node(&mut self, body: &mut Body, node: &Node) -> Result<(), LoweringError> {
        let span = node.span;
        trace!(node = node.kind.name(), %span, at = body.here(), "lowering");

        match &node.kind {
            NodeKind::Arrow { lhs, rhs } => self.lower_arrow(body, lhs, rhs, span),

            NodeKind::Call { name } => self.lower_call(body, name, span),

            NodeKind::NoArg(op) => self.lower_no_arg(body, *op, span),

            NodeKind::NoRet { op, arg } => {
                self.emit_arg(body, arg, span)?;
                body.ctx.pop_top();
                body.emit_bare(match op {
                    NoRetOp::Print => Opcode::PrintLong,
                    NoRetOp::PrintChar => Opcode::PrintChar,
                    NoRetOp::Exit => Opcode::Exit,
                });
                Ok(())
            }

            NodeKind::Unary { op, dst, arg } => {
                self.emit_arg(body, arg, span)?;
                body.emit_bare(unary_opcode(*op));
                body.ctx.pop_top();
                body.store(*dst, span)?;
                body.ctx.set_reg_type(*dst, Some(RegisterType::Long));
                Ok(())
            }

            NodeKind::Binary { op, dst, lhs, rhs } => {
                let opcode = binary_opcode(*op)
                    .ok_or_else(|| LoweringError::unsupported("xor", span).with_hint("no opcode implements xor"))?;
                self.check_types(body, lhs, rhs, span)?;
                self.emit_arg(body, lhs, span)?;
                self.emit_arg(body, rhs, span)?;
                body.emit_bare(opcode);
                body.ctx.pop_top();
                body.ctx.pop_top();
                body.store(*dst, span)?;
                body.ctx.set_reg_type(*dst, Some(RegisterType::Long));
                Ok(())
            }

            NodeKind::Memory { op, reg, location } => self.lower_memory(body, *op, *reg, location, span),

            NodeKind::If {
                condition,
                body: then_body,
                elifs,
                else_body,
            } => self.lower_if(body, condition, then_body, elifs, else_body.as_deref(), span),

            NodeKind::While { condition, body: loop_body } => self.lower_while(body, condition, loop_body, span),
        }
    }

    // -------------------------------------------------------------------------
    // Operands
    // -------------------------------------------------------------------------

    /// Push `arg`, as a `Dup` when it's already on top of the stack.
    fn emit_arg(&mut self, body: &mut Body, arg: &Arg, span: Span) -> Result<(), LoweringError> {
        if body.ctx.same_as_top(arg) {
            body.emit_bare(Opcode::Dup);
        } else {
            match arg {
                Arg::Imm(Immediate::Int(value)) => body.constant(*value),
                Arg::Imm(Immediate::Float(value)) => {
                    return Err(LoweringError::float_immediate(*value, span));
                }
                Arg::Reg(reg) => body.load(*reg, span)?,
            }
        }
        body.ctx.push_top(*arg);
        Ok(())
    }

    fn compatible(&self, body: &Body, lhs: &Arg, rhs: &Arg) -> bool {
        match (lhs, rhs) {
            (Arg::Imm(a), Arg::Imm(b)) => std::mem::discriminant(a) == std::mem::discriminant(b),
            (Arg::Reg(a), Arg::Reg(b)) => match (body.ctx.reg_type(*a), body.ctx.reg_type(*b)) {
                (Some(x), Some(y)) => x.same_kind(y),
                _ => true,
            },
            (Arg::Reg(reg), Arg::Imm(imm)) | (Arg::Imm(imm), Arg::Reg(reg)) => {
                body.ctx.reg_type(*reg).is_none_or(|ty| imm_matches(ty, imm))
            }
        }
    }

    fn check_types(&self, body: &Body, lhs: &Arg, rhs: &Arg, span: Span) -> Result<(), LoweringError> {
        if self.compatible(body, lhs, rhs) {
            return Ok(());
        }
        let err = LoweringError::type_mismatch(&lhs.to_string(), &rhs.to_string(), span);
        if self.config.strict_types {
            return Err(err);
        }
        warn!(%err, "continuing past type mismatch");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Calls and bare ops
    // -------------------------------------------------------------------------

    fn lower_call(&mut self, body: &mut Body, name: &str, span: Span) -> Result<(), LoweringError> {
        let chunk = self.chunk_of(name, span)?;
        let param = i8::try_from(chunk.0).map_err(|_| LoweringError::out_of_range("chunk id", chunk.0 as i64, span))?;
        body.emit(Opcode::Call, param);
        // The callee leaves its results in our outgoing bank.
        for id in 0..BANK_SIZE as u8 {
            body.ctx.set_reg_type(Register::outgoing(id), None);
        }
        Ok(())
    }

    fn lower_no_arg(&mut self, body: &mut Body, op: NoArgOp, span: Span) -> Result<(), LoweringError> {
        match op {
            NoArgOp::Trap => {
                body.emit_bare(Opcode::Trap);
            }
            NoArgOp::Ret => {
                body.emit_bare(Opcode::Return);
            }
            NoArgOp::Break => {
                if body.loops.is_empty() {
                    return Err(LoweringError::unsupported("break", span).with_hint("break is only valid inside while"));
                }
                let at = body.emit(Opcode::Jump, 0);
                if let Some(labels) = body.loops.last_mut() {
                    labels.breaks.push(at);
                }
            }
            NoArgOp::Continue => {
                let header = body.loops.last().map(|labels| labels.header).ok_or_else(|| {
                    LoweringError::unsupported("continue", span).with_hint("continue is only valid inside while")
                })?;
                let param = displacement(body.here(), header, span)?;
                body.emit(Opcode::Jump, param);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Assignment and memory
    // -------------------------------------------------------------------------

    fn lower_arrow(&mut self, body: &mut Body, lhs: &ArrowLhs, rhs: &ArrowRhs, span: Span) -> Result<(), LoweringError> {
        let rhs_type = match rhs {
            ArrowRhs::Reg(src) => {
                body.take(*src, span)?;
                body.ctx.reg_type(*src).cloned()
            }
            ArrowRhs::Member(member) => {
                let field = self.field_of(member, span)?;
                body.load(member.obj, span)?;
                body.emit(Opcode::MoveOutObjectField, field);
                self.field_types.get(&member.symbol()).cloned()
            }
            ArrowRhs::Make(ty) => {
                self.emit_make(body, ty, span)?;
                Some(RegisterType::Ptr(Box::new(ty.clone())))
            }
        };

        match lhs {
            ArrowLhs::Reg(dst) => {
                // Release whatever the register held before.
                body.take(*dst, span)?;
                body.emit_bare(Opcode::Destroy);
                body.store(*dst, span)?;
                body.ctx.set_reg_type(*dst, rhs_type);
            }
            ArrowLhs::Member(member) => {
                let field = self.field_of(member, span)?;
                body.load(member.obj, span)?;
                body.emit_bare(Opcode::Rot2);
                body.emit(Opcode::StoreObjectField, field);
            }
        }
        Ok(())
    }

    /// Allocate an instance of `ty` and leave the pointer on the stack.
    fn emit_make(&mut self, body: &mut Body, ty: &ObjectType, span: Span) -> Result<(), LoweringError> {
        let ObjectType::Named(name) = ty else {
            let class = self.box_class(ty, span)?;
            body.small(class.0);
            body.emit(Opcode::AllocateImm, (2 * VALUE_WIDTH) as i8);
            return Ok(());
        };

        let class = self.class_of(name, span)?;
        let (cells, ctor) = match self.class_record(class) {
            Some(record) => (record.cells(), record.ctor),
            None => return Err(LoweringError::unknown_symbol(name, span)),
        };
        let ctor = i8::try_from(ctor.0).map_err(|_| LoweringError::out_of_range("chunk id", ctor.0 as i64, span))?;

        body.small(class.0);
        let size = cells * VALUE_WIDTH;
        match i8::try_from(size) {
            Ok(param) => {
                body.emit(Opcode::AllocateImm, param);
            }
            Err(_) => {
                body.constant(size as i64);
                body.emit_bare(Opcode::Allocate);
            }
        }

        // The constructor sees the new object as p0.
        let o0 = translate(Register::outgoing(0)) as i8;
        body.emit(Opcode::StoreAuxiliary, o0);
        body.emit(Opcode::Call, ctor);
        body.emit(Opcode::MoveAuxiliary, o0);
        body.ctx.set_reg_type(Register::outgoing(0), None);
        Ok(())
    }

    /// Class record boxing a primitive, created on first use.
    fn box_class(&mut self, ty: &ObjectType, span: Span) -> Result<ClassId, LoweringError> {
        self.check_object(ty, span)?;
        let name = ty.box_name();
        match self.exe.symbol(&name) {
            Some(Symbol::Class(class)) => return Ok(class),
            Some(_) => return Err(LoweringError::wrong_symbol(&name, "type", span)),
            None => {}
        }

        let field = match ty {
            ObjectType::Long => ValueKind::Long,
            ObjectType::Double => ValueKind::Double,
            _ => ValueKind::DataPtr,
        };
        let class = ClassId(self.exe.classes.len());
        self.exe.classes.push(ClassRecord {
            name: name.clone(),
            fields: vec![field],
            ctor: ChunkId(0),
            dtor: ChunkId(0),
        });
        debug!(%name, class = class.0, "created box class");
        self.exe.symbols.insert(name, Symbol::Class(class));
        Ok(class)
    }

    fn lower_memory(
        &mut self,
        body: &mut Body,
        op: MemoryOp,
        reg: Register,
        location: &MemoryLocation,
        span: Span,
    ) -> Result<(), LoweringError> {
        let (obj, field, field_type) = match location {
            MemoryLocation::Member(member) => (
                member.obj,
                self.field_of(member, span)?,
                self.field_types.get(&member.symbol()).cloned(),
            ),
            MemoryLocation::Reg(ptr) => (*ptr, 0, pointee(body.ctx.reg_type(*ptr))),
        };

        match op {
            MemoryOp::Load => {
                body.load(obj, span)?;
                body.emit(Opcode::LoadObjectField, field);
                body.store(reg, span)?;
                body.ctx.set_reg_type(reg, field_type);
            }
            MemoryOp::Store => {
                body.load(obj, span)?;
                body.load(reg, span)?;
                body.emit(Opcode::StoreObjectField, field);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------------

    /// Condition, negated, then a placeholder `TestAndJump` taken when the
    /// condition was false. Returns the placeholder's position.
    fn emit_test(&mut self, body: &mut Body, condition: &Arg, span: Span) -> Result<usize, LoweringError> {
        self.emit_arg(body, condition, span)?;
        body.emit_bare(Opcode::LogicalNeg);
        body.ctx.pop_top();
        Ok(body.emit(Opcode::TestAndJump, 0))
    }

    /// Each arm tests its condition and skips to the next arm when false;
    /// every taken arm jumps to one shared landing pad.
    ///
    /// ```text
    ///        <cond> LNEG TEST_JUMP ─┐
    ///        <body>                 │
    ///        JUMP ───────────────┐  │
    ///        <cond> LNEG TEST_JUMP ◄┘ ...
    ///        ...                 │
    ///        <else body>         │
    ///        NOP ◄───────────────┘
    /// ```
    fn lower_if(
        &mut self,
        body: &mut Body,
        condition: &Arg,
        then_body: &[Node],
        elifs: &[Elif],
        else_body: Option<&[Node]>,
        span: Span,
    ) -> Result<(), LoweringError> {
        let arms = std::iter::once((condition, then_body)).chain(elifs.iter().map(|elif| (&elif.condition, elif.body.as_slice())));

        let mut exits = Vec::with_capacity(1 + elifs.len());
        for (cond, nodes) in arms {
            let skip = self.emit_test(body, cond, span)?;
            self.lower_scoped(body, nodes)?;
            exits.push(body.emit(Opcode::Jump, 0));
            let next_arm = body.here();
            body.patch(skip, next_arm, span)?;
        }

        if let Some(nodes) = else_body {
            self.lower_scoped(body, nodes)?;
        }

        let landing = body.emit_bare(Opcode::Nop);
        for exit in exits {
            body.patch(exit, landing, span)?;
        }
        Ok(())
    }

    fn lower_while(&mut self, body: &mut Body, condition: &Arg, nodes: &[Node], span: Span) -> Result<(), LoweringError> {
        let header = body.here();
        let exit = self.emit_test(body, condition, span)?;

        body.loops.push(LoopLabels {
            header,
            breaks: Vec::new(),
        });
        let lowered = self.lower_scoped(body, nodes);
        let labels = body.loops.pop();
        lowered?;

        let back = displacement(body.here(), header, span)?;
        body.emit(Opcode::Jump, back);

        let landing = body.emit_bare(Opcode::Nop);
        body.patch(exit, landing, span)?;
        if let Some(labels) = labels {
            for at in labels.breaks {
                body.patch(at, landing, span)?;
            }
        }
        Ok(())
    }
}
