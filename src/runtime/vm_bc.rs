use crate::bytecode::ir::{AUX_BASE_SIZE, AUX_WINDOW_SIZE, ClassRecord, VALUE_WIDTH};
use crate::bytecode::{Executable, Opcode};
use crate::runtime::heap::Heap;
use crate::runtime::runtime_error::{Fault, FaultKind};
use std::collections::VecDeque;
use std::io::{self, Write};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub max_steps: Option<u64>,
    pub max_call_depth: Option<usize>,
}

/// Saved caller state.
#[derive(Debug, Clone)]
struct Frame {
    pc: usize,
    chunk: usize,
    constant_base: i64,
    global_base: i64,
    /// Object to free once this frame returns, set when the call was a
    /// destructor run by `Destroy`.
    release: Option<i64>,
}

/// What the dispatch loop does after an instruction.
enum Flow {
    Next,
    Jumped,
    Exit(i64),
}

pub struct Vm<W: Write = io::Stdout> {
    stack: Vec<i64>,
    aux: VecDeque<i64>,
    frames: Vec<Frame>,
    heap: Heap,
    globals: Vec<i64>,

    // Cursor
    chunk: usize,
    pc: usize,
    constant_base: i64,
    global_base: i64,

    // Safety limits
    config: VmConfig,
    steps: u64,

    out: W,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(io::stdout())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Vm<W> {
    pub fn with_output(out: W) -> Self {
        Self::with_config(VmConfig::default(), out)
    }

    pub fn with_config(config: VmConfig, out: W) -> Self {
        Self {
            stack: Vec::new(),
            aux: VecDeque::from(vec![0; AUX_BASE_SIZE]),
            frames: Vec::new(),
            heap: Heap::new(),
            globals: Vec::new(),
            chunk: 0,
            pc: 0,
            constant_base: 0,
            global_base: 0,
            config,
            steps: 0,
            out,
        }
    }

    pub fn stack(&self) -> &[i64] {
        &self.stack
    }

    pub fn aux(&self) -> &VecDeque<i64> {
        &self.aux
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn globals(&self) -> &[i64] {
        &self.globals
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn reset(&mut self, exe: &Executable) {
        self.stack.clear();
        self.aux = VecDeque::from(vec![0; AUX_BASE_SIZE]);
        self.frames.clear();
        self.heap = Heap::new();
        self.globals = exe.globals.clone();
        self.chunk = exe.entry.0;
        self.pc = 0;
        self.constant_base = 0;
        self.global_base = 0;
        self.steps = 0;
    }

    /// Run `exe` from its entry chunk.
    ///
    /// Returns the value `Exit` left on top of the stack, or 0 when the
    /// outermost `Return` is reached with no caller left.
    pub fn run(&mut self, exe: &Executable) -> Result<i64, Fault> {
        self.reset(exe);

        if exe.chunks.len() <= 1 {
            debug!("executable has no code beyond chunk 0");
            return Ok(0);
        }
        if self.chunk >= exe.chunks.len() {
            return Err(self.fault(FaultKind::InvalidChunk(self.chunk as i64)));
        }
        info!(entry = self.chunk, chunks = exe.chunks.len(), "starting");

        loop {
            let code = &exe.chunks[self.chunk].code;
            let Some(&inst) = code.get(self.pc) else {
                return Err(self.fault(FaultKind::ChunkOverrun { len: code.len() }));
            };
            self.check_limits()?;
            let op = inst
                .opcode()
                .map_err(|byte| self.fault(FaultKind::BadOpcode(byte)))?;

            let address = exe.chunk_locations.get(self.chunk).copied().unwrap_or(0) + 2 * self.pc as u64;
            trace!(
                cycle = self.steps,
                address,
                chunk = self.chunk,
                pc = self.pc,
                op = op.mnemonic(),
                param = inst.param,
                depth = self.stack.len(),
                "dispatch"
            );

            match self.exec(exe, op, inst.param)? {
                Flow::Next => self.pc += 1,
                Flow::Jumped => {}
                Flow::Exit(value) => {
                    info!(result = value, steps = self.steps, "exit");
                    return Ok(value);
                }
            }
        }
    }

    // Execution

    fn check_limits(&mut self) -> Result<(), Fault> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(self.fault(FaultKind::StepLimit(max)));
            }
        }
        Ok(())
    }

    fn exec(&mut self, exe: &Executable, op: Opcode, param: i8) -> Result<Flow, Fault> {
        match op {
            // ── debug / error ──
            Opcode::Trap => return Err(self.fault(FaultKind::Trap)),
            Opcode::Exit => {
                let value = self.peek()?;
                return Ok(Flow::Exit(value));
            }
            Opcode::Breakpoint => {
                info!(
                    chunk = self.chunk,
                    pc = self.pc,
                    stack = ?self.stack,
                    frames = self.frames.len(),
                    "breakpoint"
                );
            }
            Opcode::PrintLong => {
                let value = self.pop()?;
                writeln!(self.out, "{}", value).map_err(|e| self.output_fault(e))?;
            }
            Opcode::PrintChar => {
                let value = self.pop()?;
                if !(0..128).contains(&value) {
                    warn!(value, "only ascii characters are supported");
                }
                self.out.write_all(&[value as u8]).map_err(|e| self.output_fault(e))?;
            }

            // ── binary arithmetic ──
            Opcode::Nop => {}
            Opcode::AddLong => self.binary(|a, b| Ok(a.wrapping_add(b)))?,
            Opcode::SubLong => self.binary(|a, b| Ok(a.wrapping_sub(b)))?,
            Opcode::MulLong => self.binary(|a, b| Ok(a.wrapping_mul(b)))?,
            Opcode::IDivLong => self.binary(|a, b| match b {
                0 => Err(FaultKind::DivisionByZero),
                _ => Ok(a.wrapping_div(b)),
            })?,
            Opcode::ModuloLong => self.binary(|a, b| match b {
                0 => Err(FaultKind::DivisionByZero),
                _ => Ok(a.wrapping_rem(b)),
            })?,
            Opcode::LeftShiftLong => self.binary(|a, b| Ok(a.wrapping_shl(b as u32)))?,
            Opcode::RightShiftLogicalLong => {
                self.binary(|a, b| Ok((a as u64).wrapping_shr(b as u32) as i64))?
            }
            Opcode::RightShiftArithmeticLong => self.binary(|a, b| Ok(a.wrapping_shr(b as u32)))?,
            Opcode::LogicalAndLong => self.binary(|a, b| Ok(a & b))?,
            Opcode::LogicalOrLong => self.binary(|a, b| Ok(a | b))?,
            Opcode::AddFloat => self.binary_float(|a, b| a + b)?,
            Opcode::SubFloat => self.binary_float(|a, b| a - b)?,
            Opcode::MulFloat => self.binary_float(|a, b| a * b)?,
            Opcode::DivFloat => self.binary_float(|a, b| a / b)?,

            // ── unary arithmetic ──
            Opcode::LogicalNeg => {
                let value = self.pop()?;
                self.stack.push((value == 0) as i64);
            }
            Opcode::BinaryNeg => {
                let value = self.pop()?;
                self.stack.push(!value);
            }
            Opcode::ArithmeticNeg => {
                let value = self.pop()?;
                self.stack.push(value.wrapping_neg());
            }

            // ── loading / storing ──
            Opcode::ImmByte => self.stack.push(param as i64),
            Opcode::Constant => {
                let constants = &exe.chunks[self.chunk].constants;
                let index = self.constant_base + param as i64;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|i| constants.get(i).copied())
                    .ok_or_else(|| {
                        self.fault(FaultKind::ConstantOutOfRange {
                            index,
                            len: constants.len(),
                        })
                    })?;
                self.stack.push(value);
            }
            Opcode::BiasConstantWindow => self.constant_base += param as i64,
            Opcode::LoadGlobal => {
                let index = self.global_slot(param)?;
                if index >= self.globals.len() {
                    warn!(index, "read of uninitialized global");
                    self.globals.resize(index + 1, 0);
                }
                self.stack.push(self.globals[index]);
            }
            Opcode::StoreGlobal => {
                let value = self.pop()?;
                let index = self.global_slot(param)?;
                if index >= self.globals.len() {
                    debug!(size = index + 1, "growing globals");
                    self.globals.resize(index + 1, 0);
                }
                self.globals[index] = value;
            }
            Opcode::BiasGlobalWindow => self.global_base += param as i64,
            Opcode::StoreAuxiliary => {
                let slot = self.aux_slot(param)?;
                let value = self.pop()?;
                self.aux[slot] = value;
            }
            Opcode::LoadAuxiliary => {
                let slot = self.aux_slot(param)?;
                self.stack.push(self.aux[slot]);
            }
            Opcode::MoveAuxiliary => {
                let slot = self.aux_slot(param)?;
                self.stack.push(self.aux[slot]);
                self.aux[slot] = 0;
            }

            // ── stack manipulation ──
            Opcode::Dup => {
                let value = self.peek()?;
                self.stack.push(value);
            }
            Opcode::Dup2 => {
                let tos = self.pop()?;
                let tos1 = self.peek()?;
                self.stack.extend([tos, tos1, tos]);
            }
            Opcode::Rot2 => {
                let tos = self.pop()?;
                let tos1 = self.pop()?;
                self.stack.extend([tos, tos1]);
            }
            Opcode::Rot3 => {
                let tos = self.pop()?;
                let tos1 = self.pop()?;
                let tos2 = self.pop()?;
                self.stack.extend([tos1, tos, tos2]);
            }
            Opcode::Drop => {
                self.pop()?;
            }

            // ── control flow ──
            Opcode::Jump => {
                self.jump(exe, param)?;
                return Ok(Flow::Jumped);
            }
            Opcode::TestAndJump => {
                if self.pop()? != 0 {
                    self.jump(exe, param)?;
                    return Ok(Flow::Jumped);
                }
            }
            Opcode::Call => {
                self.call(exe, param as i64, None)?;
                return Ok(Flow::Jumped);
            }
            Opcode::Return => {
                let Some(frame) = self.frames.pop() else {
                    info!("returned from outermost frame");
                    return Ok(Flow::Exit(0));
                };
                for _ in 0..AUX_WINDOW_SIZE {
                    self.aux.pop_front();
                }
                self.pc = frame.pc + 1;
                self.chunk = frame.chunk;
                self.constant_base = frame.constant_base;
                self.global_base = frame.global_base;
                if let Some(ptr) = frame.release {
                    self.heap.free(ptr);
                    debug!(ptr = format_args!("{:#x}", ptr), "released after destructor");
                }
                debug!(chunk = self.chunk, pc = self.pc, "return");
                return Ok(Flow::Jumped);
            }

            // ── objects ──
            Opcode::Allocate => {
                let size = self.pop()?;
                let class = self.pop()?;
                self.allocate(exe, class, size)?;
            }
            Opcode::AllocateImm => {
                let class = self.pop()?;
                self.allocate(exe, class, param as i64)?;
            }
            Opcode::Deallocate => {
                let ptr = self.pop()?;
                if self.heap.free(ptr) {
                    debug!(ptr = format_args!("{:#x}", ptr), "deallocated");
                } else {
                    warn!(value = ptr, "deallocate of a non-pointer ignored");
                }
            }
            Opcode::LoadClassConstructor => {
                let ctor = self.class(exe, param as i64)?.ctor;
                self.stack.push(ctor.0 as i64);
            }
            Opcode::LoadClassDestructor => {
                let dtor = self.class(exe, param as i64)?.dtor;
                self.stack.push(dtor.0 as i64);
            }
            Opcode::LoadObjectDestructor => {
                let ptr = self.peek()?;
                let dtor = self.class_of_object(exe, ptr)?.dtor;
                self.stack.push(dtor.0 as i64);
            }
            Opcode::LoadObjectField => {
                let ptr = self.pop()?;
                let cell = self.field_cell(exe, ptr, param)?;
                let value = self.object(ptr)?[cell];
                if self.heap.is_pointer(value) {
                    return Err(self.fault(FaultKind::PointerField { index: param as i64 }));
                }
                self.stack.push(value);
            }
            Opcode::StoreObjectField => {
                let value = self.pop()?;
                let ptr = self.pop()?;
                let cell = self.field_cell(exe, ptr, param)?;
                self.object_mut(ptr)?[cell] = value;
            }
            Opcode::MoveOutObjectField => {
                let ptr = self.pop()?;
                let cell = self.field_cell(exe, ptr, param)?;
                let cells = self.object_mut(ptr)?;
                let value = std::mem::take(&mut cells[cell]);
                self.stack.push(value);
            }
            Opcode::Destroy => {
                let value = self.pop()?;
                if !self.heap.is_pointer(value) {
                    return Ok(Flow::Next);
                }
                let dtor = self.class_of_object(exe, value)?.dtor;
                if dtor.0 == 0 {
                    self.heap.free(value);
                    debug!(ptr = format_args!("{:#x}", value), "destroyed without destructor");
                    return Ok(Flow::Next);
                }
                // The destructor receives the object as p0.
                self.aux[0] = value;
                self.call(exe, dtor.0 as i64, Some(value))?;
                return Ok(Flow::Jumped);
            }
        }
        Ok(Flow::Next)
    }

    // Helpers

    fn fault(&self, kind: FaultKind) -> Fault {
        let fault = Fault::new(kind, self.chunk, self.pc)
            .with_call_stack(self.frames.iter().map(|frame| frame.chunk).collect());
        error!(chunk = self.chunk, pc = self.pc, "{}", fault.kind);
        fault
    }

    fn output_fault(&self, err: io::Error) -> Fault {
        self.fault(FaultKind::Output(err.to_string()))
    }

    fn pop(&mut self) -> Result<i64, Fault> {
        self.stack
            .pop()
            .ok_or_else(|| self.fault(FaultKind::StackUnderflow))
    }

    fn peek(&self) -> Result<i64, Fault> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| self.fault(FaultKind::StackUnderflow))
    }

    /// ( tos1 tos -- f(tos1, tos) )
    fn binary(&mut self, f: impl FnOnce(i64, i64) -> Result<i64, FaultKind>) -> Result<(), Fault> {
        let tos = self.pop()?;
        let tos1 = self.pop()?;
        let value = f(tos1, tos).map_err(|kind| self.fault(kind))?;
        self.stack.push(value);
        Ok(())
    }

    /// Doubles travel as their bit patterns.
    fn binary_float(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), Fault> {
        self.binary(|a, b| {
            let value = f(f64::from_bits(a as u64), f64::from_bits(b as u64));
            Ok(value.to_bits() as i64)
        })
    }

    fn aux_slot(&self, param: i8) -> Result<usize, Fault> {
        usize::try_from(param)
            .ok()
            .filter(|&slot| slot < self.aux.len())
            .ok_or_else(|| self.fault(FaultKind::AuxOutOfRange(param as i64)))
    }

    fn global_slot(&self, param: i8) -> Result<usize, Fault> {
        let index = self.global_base + param as i64;
        usize::try_from(index).map_err(|_| self.fault(FaultKind::GlobalOutOfRange(index)))
    }

    fn jump(&mut self, exe: &Executable, param: i8) -> Result<(), Fault> {
        let target = self.pc as i64 + param as i64;
        self.pc = usize::try_from(target).map_err(|_| {
            self.fault(FaultKind::ChunkOverrun {
                len: exe.chunks[self.chunk].code.len(),
            })
        })?;
        trace!(pc = self.pc, "jump");
        Ok(())
    }

    /// Enter chunk `target`, shifting a fresh window in front of the
    /// caller's so its outgoing bank becomes the callee's params.
    fn call(&mut self, exe: &Executable, target: i64, release: Option<i64>) -> Result<(), Fault> {
        let chunk = usize::try_from(target)
            .ok()
            .filter(|&chunk| chunk < exe.chunks.len())
            .ok_or_else(|| self.fault(FaultKind::InvalidChunk(target)))?;

        if let Some(max) = self.config.max_call_depth {
            if self.frames.len() >= max {
                return Err(self.fault(FaultKind::CallDepth(max)));
            }
        }

        self.frames.push(Frame {
            pc: self.pc,
            chunk: self.chunk,
            constant_base: self.constant_base,
            global_base: self.global_base,
            release,
        });
        for _ in 0..AUX_WINDOW_SIZE {
            self.aux.push_front(0);
        }

        self.chunk = chunk;
        self.pc = 0;
        self.constant_base = 0;
        self.global_base = 0;
        debug!(chunk, depth = self.frames.len(), "call");
        Ok(())
    }

    fn class<'e>(&self, exe: &'e Executable, class: i64) -> Result<&'e ClassRecord, Fault> {
        usize::try_from(class)
            .ok()
            .and_then(|i| exe.classes.get(i))
            .ok_or_else(|| self.fault(FaultKind::InvalidClass(class)))
    }

    fn object(&self, ptr: i64) -> Result<&[i64], Fault> {
        self.heap
            .get(ptr)
            .ok_or_else(|| self.fault(FaultKind::NotAPointer(ptr)))
    }

    fn object_mut(&mut self, ptr: i64) -> Result<&mut [i64], Fault> {
        if !self.heap.is_pointer(ptr) {
            return Err(self.fault(FaultKind::NotAPointer(ptr)));
        }
        self.heap
            .get_mut(ptr)
            .ok_or_else(|| Fault::new(FaultKind::NotAPointer(ptr), self.chunk, self.pc))
    }

    fn class_of_object<'e>(&self, exe: &'e Executable, ptr: i64) -> Result<&'e ClassRecord, Fault> {
        let class = self.object(ptr)?[0];
        self.class(exe, class)
    }

    /// Cell holding field `index` of the object behind `ptr`, after
    /// checking the index against the object's class.
    fn field_cell(&self, exe: &Executable, ptr: i64, index: i8) -> Result<usize, Fault> {
        let count = self.class_of_object(exe, ptr)?.fields.len();
        let cells = self.object(ptr)?.len();
        match usize::try_from(index) {
            Ok(i) if i < count && i + 1 < cells => Ok(i + 1),
            _ => Err(self.fault(FaultKind::FieldOutOfRange {
                index: index as i64,
                count,
            })),
        }
    }

    fn allocate(&mut self, exe: &Executable, class: i64, bytes: i64) -> Result<(), Fault> {
        self.class(exe, class)?;
        let cells = usize::try_from(bytes).unwrap_or(0).div_ceil(VALUE_WIDTH);
        let ptr = self
            .heap
            .allocate(cells, class)
            .ok_or_else(|| self.fault(FaultKind::HeapExhausted))?;
        debug!(class, bytes, ptr = format_args!("{:#x}", ptr), "allocated");
        self.stack.push(ptr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{Chunk, ChunkId, ValueKind};
    use crate::bytecode::Instruction;

    // ============================================================
    // Test Helpers
    // ============================================================

    fn i(op: Opcode, param: i8) -> Instruction {
        Instruction::new(op, param)
    }

    fn b(op: Opcode) -> Instruction {
        Instruction::bare(op)
    }

    /// Executable whose entry chunk is `code`
    fn exe_from_ops(code: Vec<Instruction>) -> Executable {
        Executable::from_chunks(vec![Chunk::from_code(code)])
    }

    /// Run and return the result plus everything printed
    fn run_exe(exe: &Executable) -> Result<(i64, String), Fault> {
        let mut vm = Vm::with_output(Vec::new());
        let result = vm.run(exe)?;
        Ok((result, String::from_utf8_lossy(vm.output()).into_owned()))
    }

    fn run_ops(code: Vec<Instruction>) -> Result<i64, Fault> {
        run_exe(&exe_from_ops(code)).map(|(result, _)| result)
    }

    /// Assert execution faults with the given kind
    fn assert_fault(exe: &Executable, expected: FaultKind) -> Fault {
        match run_exe(exe) {
            Ok((result, _)) => panic!("expected fault {:?}, got result {}", expected, result),
            Err(fault) => {
                assert_eq!(fault.kind, expected, "unexpected fault: {}", fault);
                fault
            }
        }
    }

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pair_class(dtor: usize) -> ClassRecord {
        ClassRecord {
            name: "Pair".to_string(),
            fields: vec![ValueKind::Long, ValueKind::Long],
            ctor: ChunkId(0),
            dtor: ChunkId(dtor),
        }
    }

    // ============================================================
    // Arithmetic and output
    // ============================================================

    #[test]
    fn test_print_arithmetic() {
        let exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 3),
            i(Opcode::ImmByte, 5),
            b(Opcode::AddLong),
            i(Opcode::ImmByte, 2),
            b(Opcode::MulLong),
            b(Opcode::PrintLong),
            b(Opcode::Return),
        ]);
        assert_eq!(run_exe(&exe).unwrap(), (0, "16\n".to_string()));
    }

    #[test]
    fn test_dispatch_trace_carries_cycle_and_address() {
        let exe = exe_from_ops(vec![b(Opcode::Nop), i(Opcode::ImmByte, 4), b(Opcode::Exit)]);
        let base = exe.chunk_locations[1];
        assert_eq!(base, 2);

        let capture = Capture::default();
        let sink = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || run_exe(&exe));
        assert_eq!(result.unwrap().0, 4);

        let log = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(log.contains("cycle=1 address=2 chunk=1 pc=0"), "{}", log);
        assert!(log.contains("cycle=3 address=6 chunk=1 pc=2"), "{}", log);
    }

    #[test]
    fn test_operand_order() {
        let result = run_ops(vec![
            i(Opcode::ImmByte, 10),
            i(Opcode::ImmByte, 3),
            b(Opcode::SubLong),
            b(Opcode::Exit),
        ]);
        assert_eq!(result.unwrap(), 7);

        let result = run_ops(vec![
            i(Opcode::ImmByte, -7),
            i(Opcode::ImmByte, 2),
            b(Opcode::ModuloLong),
            b(Opcode::Exit),
        ]);
        assert_eq!(result.unwrap(), -1);
    }

    #[test]
    fn test_shifts() {
        let srl = run_ops(vec![
            i(Opcode::ImmByte, -1),
            i(Opcode::ImmByte, 60),
            b(Opcode::RightShiftLogicalLong),
            b(Opcode::Exit),
        ]);
        assert_eq!(srl.unwrap(), 0xF);

        let sra = run_ops(vec![
            i(Opcode::ImmByte, -16),
            i(Opcode::ImmByte, 2),
            b(Opcode::RightShiftArithmeticLong),
            b(Opcode::Exit),
        ]);
        assert_eq!(sra.unwrap(), -4);
    }

    #[test]
    fn test_unary_ops() {
        assert_eq!(run_ops(vec![i(Opcode::ImmByte, 0), b(Opcode::LogicalNeg), b(Opcode::Exit)]).unwrap(), 1);
        assert_eq!(run_ops(vec![i(Opcode::ImmByte, 9), b(Opcode::LogicalNeg), b(Opcode::Exit)]).unwrap(), 0);
        assert_eq!(run_ops(vec![i(Opcode::ImmByte, 0), b(Opcode::BinaryNeg), b(Opcode::Exit)]).unwrap(), -1);
        assert_eq!(run_ops(vec![i(Opcode::ImmByte, 5), b(Opcode::ArithmeticNeg), b(Opcode::Exit)]).unwrap(), -5);
    }

    #[test]
    fn test_float_ops_use_bit_patterns() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::Constant, 0),
            i(Opcode::Constant, 1),
            b(Opcode::MulFloat),
            b(Opcode::Exit),
        ]);
        exe.chunks[1].constants = vec![1.5f64.to_bits() as i64, 4.0f64.to_bits() as i64];
        let bits = run_exe(&exe).unwrap().0;
        assert_eq!(f64::from_bits(bits as u64), 6.0);
    }

    #[test]
    fn test_print_char() {
        let exe = exe_from_ops(vec![
            i(Opcode::ImmByte, b'h' as i8),
            b(Opcode::PrintChar),
            i(Opcode::ImmByte, b'i' as i8),
            b(Opcode::PrintChar),
            b(Opcode::Return),
        ]);
        assert_eq!(run_exe(&exe).unwrap().1, "hi");
    }

    #[test]
    fn test_empty_executable_returns_zero() {
        assert_eq!(run_exe(&Executable::new()).unwrap().0, 0);
    }

    // ============================================================
    // Stack manipulation
    // ============================================================

    /// Run `code` followed by a `Return` and return the final stack
    fn run_stack(mut code: Vec<Instruction>) -> Vec<i64> {
        code.push(b(Opcode::Return));
        let mut vm = Vm::with_output(Vec::new());
        vm.run(&exe_from_ops(code)).unwrap();
        vm.stack().to_vec()
    }

    #[test]
    fn test_stack_shuffles() {
        let push = |v: i8| i(Opcode::ImmByte, v);
        assert_eq!(run_stack(vec![push(1), push(2), b(Opcode::Dup2)]), vec![1, 2, 1, 2]);
        assert_eq!(run_stack(vec![push(1), push(2), b(Opcode::Rot2)]), vec![2, 1]);
        assert_eq!(run_stack(vec![push(1), push(2), push(3), b(Opcode::Rot3)]), vec![2, 3, 1]);
        assert_eq!(run_stack(vec![push(1), b(Opcode::Dup), b(Opcode::Breakpoint)]), vec![1, 1]);
        assert_eq!(run_stack(vec![push(1), push(2), b(Opcode::Drop)]), vec![1]);
    }

    // ============================================================
    // Constants and globals
    // ============================================================

    #[test]
    fn test_constant_window_bias() {
        let exe = Executable::from_chunks(vec![Chunk {
            code: vec![
                i(Opcode::BiasConstantWindow, 2),
                i(Opcode::BiasConstantWindow, -1),
                i(Opcode::Constant, 0),
                i(Opcode::Constant, 1),
                b(Opcode::AddLong),
                b(Opcode::Exit),
            ],
            constants: vec![1, 10, 100, 1000],
        }]);
        assert_eq!(run_exe(&exe).unwrap().0, 110);
    }

    #[test]
    fn test_constant_out_of_range() {
        let exe = exe_from_ops(vec![i(Opcode::Constant, 0), b(Opcode::Exit)]);
        assert_fault(&exe, FaultKind::ConstantOutOfRange { index: 0, len: 0 });
    }

    #[test]
    fn test_globals_grow_on_access() {
        let mut vm = Vm::with_output(Vec::new());
        let exe = exe_from_ops(vec![
            i(Opcode::LoadGlobal, 3),
            i(Opcode::ImmByte, 8),
            i(Opcode::BiasGlobalWindow, 1),
            i(Opcode::StoreGlobal, 4),
            b(Opcode::Exit),
        ]);
        assert_eq!(vm.run(&exe).unwrap(), 0);
        assert_eq!(vm.globals(), &[0, 0, 0, 0, 0, 8]);
    }

    // ============================================================
    // Calls
    // ============================================================

    #[test]
    fn test_call_frame_save_and_restore() {
        let exe = Executable::from_chunks(vec![
            Chunk {
                code: vec![
                    i(Opcode::ImmByte, 2),
                    i(Opcode::ImmByte, 3),
                    i(Opcode::BiasConstantWindow, -1),
                    i(Opcode::Constant, 1),
                    i(Opcode::Call, 2),
                    b(Opcode::Drop),
                    b(Opcode::AddLong),
                    i(Opcode::Constant, 2),
                    b(Opcode::AddLong),
                    b(Opcode::AddLong),
                    b(Opcode::Exit),
                ],
                constants: vec![50, 100, 1000],
            },
            Chunk {
                code: vec![i(Opcode::ImmByte, 120), i(Opcode::ImmByte, -5), b(Opcode::Return)],
                constants: vec![],
            },
        ]);
        // 3 + 50 + 120 + 100; the 2 stays buried
        assert_eq!(run_exe(&exe).unwrap().0, 273);
    }

    #[test]
    fn test_calling_convention() {
        // caller: o0 <- 2, o1 <- 3, call; callee: r0 <- p0 + p1
        let exe = Executable::from_chunks(vec![
            Chunk::from_code(vec![
                i(Opcode::ImmByte, 2),
                i(Opcode::StoreAuxiliary, 0),
                i(Opcode::ImmByte, 3),
                i(Opcode::StoreAuxiliary, 1),
                i(Opcode::Call, 2),
                i(Opcode::LoadAuxiliary, 0),
                b(Opcode::Exit),
            ]),
            Chunk::from_code(vec![
                i(Opcode::LoadAuxiliary, 48),
                i(Opcode::LoadAuxiliary, 49),
                b(Opcode::AddLong),
                i(Opcode::StoreAuxiliary, 48),
                b(Opcode::Return),
            ]),
        ]);

        let mut vm = Vm::with_output(Vec::new());
        assert_eq!(vm.run(&exe).unwrap(), 5);
        assert_eq!(vm.aux().len(), AUX_BASE_SIZE);
        assert_eq!(vm.aux()[0], 5);
    }

    #[test]
    fn test_params_reach_every_outgoing_slot() {
        for n in 0..16i8 {
            let exe = Executable::from_chunks(vec![
                Chunk::from_code(vec![
                    i(Opcode::ImmByte, 100 + n),
                    i(Opcode::StoreAuxiliary, n),
                    i(Opcode::Call, 2),
                    b(Opcode::Exit),
                ]),
                Chunk::from_code(vec![i(Opcode::LoadAuxiliary, 48 + n), b(Opcode::Return)]),
            ]);
            assert_eq!(run_exe(&exe).unwrap().0, 100 + n as i64);
        }
    }

    #[test]
    fn test_outermost_return_ends_run() {
        let exe = exe_from_ops(vec![i(Opcode::ImmByte, 4), b(Opcode::Return), b(Opcode::Trap)]);
        assert_eq!(run_exe(&exe).unwrap().0, 0);
    }

    #[test]
    fn test_call_depth_limit() {
        let exe = exe_from_ops(vec![i(Opcode::Call, 1)]);
        let mut vm = Vm::with_config(
            VmConfig {
                max_call_depth: Some(8),
                ..Default::default()
            },
            Vec::new(),
        );
        let fault = vm.run(&exe).unwrap_err();
        assert_eq!(fault.kind, FaultKind::CallDepth(8));
        assert_eq!(fault.call_stack.len(), 8);
    }

    #[test]
    fn test_step_limit() {
        let exe = exe_from_ops(vec![b(Opcode::Nop), i(Opcode::Jump, -1)]);
        let mut vm = Vm::with_config(
            VmConfig {
                max_steps: Some(100),
                ..Default::default()
            },
            Vec::new(),
        );
        assert_eq!(vm.run(&exe).unwrap_err().kind, FaultKind::StepLimit(100));
    }

    #[test]
    fn test_test_and_jump() {
        let exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 1),
            i(Opcode::TestAndJump, 3),
            i(Opcode::ImmByte, 7),
            b(Opcode::Exit),
            i(Opcode::ImmByte, 0),
            i(Opcode::TestAndJump, 3),
            i(Opcode::ImmByte, 9),
            b(Opcode::Exit),
        ]);
        assert_eq!(run_exe(&exe).unwrap().0, 9);
    }

    // ============================================================
    // Objects
    // ============================================================

    #[test]
    fn test_field_store_and_load() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 24),
            b(Opcode::Dup),
            i(Opcode::ImmByte, 11),
            i(Opcode::StoreObjectField, 1),
            b(Opcode::Dup),
            i(Opcode::LoadObjectField, 1),
            i(Opcode::StoreAuxiliary, 32),
            i(Opcode::MoveOutObjectField, 1),
            i(Opcode::LoadAuxiliary, 32),
            b(Opcode::AddLong),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(0));
        assert_eq!(run_exe(&exe).unwrap().0, 22);
    }

    #[test]
    fn test_allocate_from_stack_size() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 0),
            i(Opcode::ImmByte, 24),
            b(Opcode::Allocate),
            i(Opcode::LoadObjectField, 1),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(0));
        assert_eq!(run_exe(&exe).unwrap().0, 0);
    }

    #[test]
    fn test_huge_allocation_faults() {
        let mut exe = Executable::from_chunks(vec![Chunk {
            code: vec![
                i(Opcode::ImmByte, 0),
                i(Opcode::Constant, 0),
                b(Opcode::Allocate),
                b(Opcode::Exit),
            ],
            constants: vec![1 << 62],
        }]);
        exe.classes.push(pair_class(0));

        let fault = assert_fault(&exe, FaultKind::HeapExhausted);
        assert_eq!((fault.chunk, fault.pc), (1, 2));
    }

    #[test]
    fn test_class_tables() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::LoadClassDestructor, 0),
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 24),
            b(Opcode::LoadObjectDestructor),
            b(Opcode::Rot2),
            b(Opcode::Drop),
            b(Opcode::AddLong),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(5));
        assert_eq!(run_exe(&exe).unwrap().0, 10);
    }

    #[test]
    fn test_destroy_runs_destructor_then_frees() {
        let mut exe = Executable::from_chunks(vec![
            Chunk::from_code(vec![
                i(Opcode::ImmByte, 0),
                i(Opcode::AllocateImm, 24),
                b(Opcode::Destroy),
                i(Opcode::ImmByte, 1),
                b(Opcode::Exit),
            ]),
            Chunk::from_code(vec![
                // p0 holds the object being destroyed
                i(Opcode::LoadAuxiliary, 48),
                i(Opcode::LoadObjectField, 0),
                b(Opcode::PrintLong),
                b(Opcode::Return),
            ]),
        ]);
        exe.classes.push(pair_class(2));

        let mut vm = Vm::with_output(Vec::new());
        assert_eq!(vm.run(&exe).unwrap(), 1);
        assert_eq!(vm.output().as_slice(), b"0\n");
        assert_eq!(vm.heap().live(), 0);
    }

    #[test]
    fn test_destroy_ignores_plain_values() {
        let result = run_ops(vec![i(Opcode::ImmByte, 3), b(Opcode::Destroy), i(Opcode::ImmByte, 2), b(Opcode::Exit)]);
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_use_after_deallocate_faults() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 8),
            b(Opcode::Dup),
            b(Opcode::Deallocate),
            i(Opcode::LoadObjectField, 0),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(0));
        let fault = run_exe(&exe).unwrap_err();
        assert!(matches!(fault.kind, FaultKind::NotAPointer(_)));
        assert_eq!(fault.pc, 4);
    }

    // ============================================================
    // Faults
    // ============================================================

    #[test]
    fn test_fault_chunk_overrun() {
        let exe = exe_from_ops(vec![i(Opcode::ImmByte, 1), b(Opcode::Nop)]);
        let fault = assert_fault(&exe, FaultKind::ChunkOverrun { len: 2 });
        assert_eq!((fault.chunk, fault.pc), (1, 2));
    }

    #[test]
    fn test_fault_field_index_past_class() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 24),
            i(Opcode::LoadObjectField, 2),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(0));
        assert_fault(&exe, FaultKind::FieldOutOfRange { index: 2, count: 2 });
    }

    #[test]
    fn test_fault_store_through_non_pointer() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 12),
            i(Opcode::ImmByte, 1),
            i(Opcode::StoreObjectField, 0),
            b(Opcode::Return),
        ]);
        exe.classes.push(pair_class(0));
        assert_fault(&exe, FaultKind::NotAPointer(12));
    }

    #[test]
    fn test_fault_pointer_field_load() {
        let mut exe = exe_from_ops(vec![
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 24),
            b(Opcode::Dup),
            i(Opcode::ImmByte, 0),
            i(Opcode::AllocateImm, 24),
            i(Opcode::StoreObjectField, 0),
            i(Opcode::LoadObjectField, 0),
            b(Opcode::Exit),
        ]);
        exe.classes.push(pair_class(0));
        assert_fault(&exe, FaultKind::PointerField { index: 0 });
    }

    #[test]
    fn test_fault_bad_opcode() {
        let exe = exe_from_ops(vec![Instruction { op: 0x3C, param: 0 }]);
        assert_fault(&exe, FaultKind::BadOpcode(0x3C));
    }

    #[test]
    fn test_fault_trap() {
        assert_fault(&exe_from_ops(vec![b(Opcode::Trap)]), FaultKind::Trap);
    }

    #[test]
    fn test_fault_division_by_zero() {
        let exe = exe_from_ops(vec![i(Opcode::ImmByte, 1), i(Opcode::ImmByte, 0), b(Opcode::IDivLong)]);
        assert_fault(&exe, FaultKind::DivisionByZero);
    }

    #[test]
    fn test_fault_stack_underflow() {
        assert_fault(&exe_from_ops(vec![b(Opcode::Drop)]), FaultKind::StackUnderflow);
    }

    #[test]
    fn test_fault_aux_out_of_range() {
        assert_fault(&exe_from_ops(vec![i(Opcode::LoadAuxiliary, 64)]), FaultKind::AuxOutOfRange(64));
        assert_fault(&exe_from_ops(vec![i(Opcode::LoadAuxiliary, -1)]), FaultKind::AuxOutOfRange(-1));
    }

    #[test]
    fn test_fault_invalid_call_target() {
        assert_fault(&exe_from_ops(vec![i(Opcode::Call, 9)]), FaultKind::InvalidChunk(9));
    }
}
