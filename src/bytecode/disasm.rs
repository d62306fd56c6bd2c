use crate::bytecode::ir::{Chunk, ChunkId, Executable, Symbol};
use crate::bytecode::{Instruction, Opcode};
use std::fmt::Write;

/// Print the disassembly of a whole executable
pub fn print_exe(exe: &Executable) {
    print!("{}", disassemble(exe));
}

/// Disassemble a whole executable: class table, then every chunk with its
/// constant pool and code.
pub fn disassemble(exe: &Executable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== EXECUTABLE ===");
    let _ = writeln!(out, "entry: chunk {}", exe.entry.0);

    if !exe.classes.is_empty() {
        let _ = writeln!(out, "\nclasses:");
        for (id, class) in exe.classes.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{}] {:<16} fields {:?}  ctor {}  dtor {}",
                id, class.name, class.fields, class.ctor.0, class.dtor.0
            );
        }
    }

    if !exe.symbols.is_empty() {
        let _ = writeln!(out, "\nsymbols:");
        for (name, symbol) in &exe.symbols {
            let _ = writeln!(out, "  {:<24} {}", name, format_symbol(symbol));
        }
    }
    let _ = writeln!(out);

    for (id, chunk) in exe.chunks.iter().enumerate() {
        let address = exe.chunk_locations.get(id).copied().unwrap_or(0);
        let label = chunk_label(exe, id);
        let _ = writeln!(out, "════════════════════════════════════════");
        let _ = writeln!(out, " chunk {} {} @ {:#06x}", id, label, address);
        let _ = writeln!(out, " {} instructions, {} constants", chunk.code.len(), chunk.constants.len());
        let _ = writeln!(out, "════════════════════════════════════════");
        disassemble_chunk(chunk, &mut out);
        let _ = writeln!(out);
    }
    out
}

fn format_symbol(symbol: &Symbol) -> String {
    match symbol {
        Symbol::Unresolved => "unresolved".to_string(),
        Symbol::Address(address) => format!("address {:#06x}", address),
        Symbol::Class(class) => format!("class {}", class.0),
        Symbol::Chunk(chunk) => format!("chunk {}", chunk.0),
        Symbol::Field(field) => format!("field {}", field.0),
    }
}

/// Names that resolve to chunk `id`.
fn chunk_label(exe: &Executable, id: usize) -> String {
    if id == 0 {
        return "<return>".to_string();
    }
    let mut names: Vec<String> = exe
        .symbols
        .iter()
        .filter(|(_, symbol)| **symbol == Symbol::Chunk(ChunkId(id)))
        .map(|(name, _)| name.clone())
        .collect();
    for class in &exe.classes {
        if class.ctor.0 == id {
            names.push(format!("{}.ctor", class.name));
        }
        if class.dtor.0 == id {
            names.push(format!("{}.dtor", class.name));
        }
    }
    names.join(", ")
}

/// Disassemble one chunk, marking jump targets.
pub fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    for (index, value) in chunk.constants.iter().enumerate() {
        let _ = writeln!(out, "  const[{}] = {}", index, value);
    }

    let jump_targets = collect_jump_targets(&chunk.code);

    for (ip, inst) in chunk.code.iter().enumerate() {
        if jump_targets.contains(&ip) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }

        let marker = if jump_targets.contains(&ip) { "► " } else { "  " };
        let _ = writeln!(out, "{:04} {}{}", ip, marker, format_inst(inst, ip));
    }
}

fn collect_jump_targets(code: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();

    for (ip, inst) in code.iter().enumerate() {
        if let Ok(op) = inst.opcode() {
            if op.is_jump() {
                let target = ip as i64 + inst.param as i64;
                if let Ok(target) = usize::try_from(target) {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
    }

    targets
}

fn format_inst(inst: &Instruction, ip: usize) -> String {
    let op = match inst.opcode() {
        Ok(op) => op,
        Err(byte) => return format!("??          {:#04x} {}", byte, inst.param),
    };

    match op {
        Opcode::Jump | Opcode::TestAndJump => {
            let target = ip as i64 + inst.param as i64;
            format!("{:<12}{:+} (→ {:04})", op.mnemonic(), inst.param, target)
        }
        Opcode::Call => format!("{:<12}chunk {}", op.mnemonic(), inst.param),
        Opcode::AllocateImm => format!("{:<12}{} bytes", op.mnemonic(), inst.param),
        _ if op.uses_param() => format!("{:<12}{}", op.mnemonic(), inst.param),
        _ => op.mnemonic().to_string(),
    }
}
