use crate::bytecode::instr::{ARITY_MAX, ARITY_SPREAD, CALL_SPREAD, Instr, Opcode, RETURN_VARS, SCOPE_GLOBAL};
use crate::bytecode::program::Program;
use crate::runtime::native;
use std::fmt::Write;

/// Render a program as text: the main body, then every defined function.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::from("=== BYTECODE PROGRAM ===\n\n");
    write_code_object(&mut out, program, "main", 0, program.main_end);
    for func in &program.funcs {
        if let (Some(entry), Some(end)) = (func.entry, func.end) {
            let label = format!(
                "{} (depth {}, {} in, {} out)",
                func.name,
                func.nest_depth,
                func.num_in(),
                func.num_out
            );
            write_code_object(&mut out, program, &label, entry, end);
        }
    }
    out
}

/// Print disassembly of a program to stdout.
pub fn print_program(program: &Program) {
    print!("{}", disassemble(program));
}

fn write_code_object(out: &mut String, program: &Program, name: &str, start: usize, end: usize) {
    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {}", name);
    let _ = writeln!(out, " {} instructions", end - start);
    let _ = writeln!(out, "════════════════════════════════════════");
    for ip in start..end {
        let _ = writeln!(out, "{:04}   {}", ip, render(program, program.code[ip]));
    }
    out.push('\n');
}

fn scope_name(scope: u32) -> String {
    if scope == SCOPE_GLOBAL {
        "global".to_string()
    } else {
        format!("up {}", scope)
    }
}

fn arity_name(field: u32) -> String {
    match field {
        ARITY_SPREAD => "...".to_string(),
        ARITY_MAX => format!("{}+", ARITY_MAX),
        n => n.to_string(),
    }
}

fn func_name(func: Option<&crate::bytecode::func::FuncInfo>) -> &str {
    func.map(|f| f.name.as_str()).unwrap_or("<unresolved>")
}

/// One instruction, mnemonic plus decoded operands.
pub fn render(program: &Program, instr: Instr) -> String {
    use Opcode::*;
    let operand = instr.operand();
    let Some(op) = instr.opcode() else {
        return format!("<bad {:#010x}>", instr.0);
    };
    let detail = match op {
        Nop => String::new(),
        PushInt => match instr.decode_push_int() {
            (Some(kind), n) => format!("{} {}", kind, n),
            (None, n) => format!("? {}", n),
        },
        PushConst => match program.consts.get(operand as usize) {
            Some(v) => format!("#{} ({} {:?})", operand, v.kind(), v.to_string()),
            None => format!("#{} <missing>", operand),
        },
        Pop => operand.to_string(),
        LoadVar | StoreVar | AddrVar => {
            let (scope, index) = instr.decode_addr();
            format!("{} [{}]", scope_name(scope), index)
        }
        LoadArg | StoreArg => format!("arg -{}", operand),
        LoadNativeVar => match native::var_info(operand) {
            Some(v) => format!("{}.{}", v.pkg, v.name),
            None => format!("@{}", operand),
        },
        AddrOp => match instr.decode_addr_op() {
            (Some(kind), Some(aop)) => format!("{} {}", kind, aop),
            _ => "<bad operand>".to_string(),
        },
        BuiltinOp => match instr.decode_builtin() {
            (Some(kind), Some(bop)) => format!("{} {}", kind, bop),
            _ => "<bad operand>".to_string(),
        },
        Convert => match crate::lang::types::Kind::from_u8(operand as u8) {
            Some(kind) => kind.to_string(),
            None => "<bad kind>".to_string(),
        },
        CallFunc => func_name(program.fixed_func(operand)).to_string(),
        CallFuncv => {
            let (field, index) = instr.decode_funcv();
            format!(
                "{} argc={}",
                func_name(program.variadic_func(index)),
                arity_name(field)
            )
        }
        CallNative | PushNative => match native::func_info(operand) {
            Some(f) => qualified(&f.pkg, &f.name),
            None => format!("@{}", operand),
        },
        CallNativev => {
            let (field, addr) = instr.decode_funcv();
            let name = match native::funcv_info(addr) {
                Some(f) => qualified(&f.pkg, &f.name),
                None => format!("@{}", addr),
            };
            format!("{} argc={}", name, arity_name(field))
        }
        PushNativev => match native::funcv_info(operand) {
            Some(f) => qualified(&f.pkg, &f.name),
            None => format!("@{}", operand),
        },
        Closure | HostClosure => {
            let (variadic, index) = instr.decode_closure();
            func_name(program.closure_func(variadic, index)).to_string()
        }
        CallClosure | CallValue if operand == CALL_SPREAD => "argc=...".to_string(),
        CallClosure | CallValue => format!("argc={}", operand),
        Deref => String::new(),
        Field => format!(".{}", operand),
        Return if operand == RETURN_VARS => "vars".to_string(),
        Return => operand.to_string(),
    };
    if detail.is_empty() {
        format!("{:?}", op)
    } else {
        format!("{:<14} {}", format!("{:?}", op), detail)
    }
}

fn qualified(pkg: &str, name: &str) -> String {
    if pkg.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", pkg, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::func::Var;
    use crate::bytecode::op::Operator;
    use crate::bytecode::program::{Builder, CallArity};
    use crate::lang::types::{Kind, Type};
    use crate::lang::value::Value;

    fn sample() -> Program {
        let mut b = Builder::new();
        let f = b.new_func("twice", 1);
        b.define_var(None, Var::new("x", Type::INT));
        b.push_value(Value::Int(21));
        b.call_func(f);
        b.store_var(SCOPE_GLOBAL, 0);
        b.push_value(Value::String("hi".into()));
        b.pop(1);
        b.call_value(CallArity::Spread);
        let end = b.len();
        b.args(f, vec![Type::INT]).unwrap();
        b.results(f, vec![Var::positional(0, Type::INT)]).unwrap();
        b.define_func(f).unwrap();
        b.load_arg(1);
        b.load_arg(1);
        b.builtin_op(Kind::Int, Operator::Add);
        b.ret(1);
        b.end_func(f).unwrap();
        b.resolve(end).unwrap()
    }

    #[test]
    fn test_banners_for_main_and_functions() {
        let text = disassemble(&sample());
        assert!(text.starts_with("=== BYTECODE PROGRAM ==="));
        assert!(text.contains(" main\n"));
        assert!(text.contains(" twice (depth 1, 1 in, 1 out)"));
        assert!(text.contains("════"));
    }

    #[test]
    fn test_operands_are_decoded() {
        let text = disassemble(&sample());
        assert!(text.contains("PushInt        int 21"));
        assert!(text.contains("CallFunc       twice"));
        assert!(text.contains("StoreVar       global [0]"));
        assert!(text.contains("PushConst      #0 (string \"hi\")"));
        assert!(text.contains("BuiltinOp      int +"));
        assert!(text.contains("LoadArg        arg -1"));
        assert!(text.contains("CallValue      argc=..."));
        assert!(text.contains("Return         1"));
    }

    #[test]
    fn test_bad_instruction() {
        let program = sample();
        assert!(render(&program, Instr(u32::MAX)).starts_with("<bad"));
    }
}
