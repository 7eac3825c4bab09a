use crate::bytecode::instr::{ARITY_MAX, ARITY_SPREAD, Instr, Opcode, RETURN_VARS};
use crate::bytecode::program::Program;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stack-check error: {message}")]
pub struct StackCheckError {
    pub message: String,
}

impl StackCheckError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Parameter and result counts of native functions, by table address.
pub trait NativeArity {
    fn func_arity(&self, addr: u32) -> Option<(usize, usize)>;
    fn funcv_arity(&self, addr: u32) -> Option<(usize, usize)>;
}

/// No natives known: every native call ends the analysis.
impl NativeArity for () {
    fn func_arity(&self, _addr: u32) -> Option<(usize, usize)> {
        None
    }

    fn funcv_arity(&self, _addr: u32) -> Option<(usize, usize)> {
        None
    }
}

/// Pops for a call to a variadic callee with `nin` declared parameters.
fn variadic_pops(field: u32, nin: usize) -> Option<i64> {
    match field {
        ARITY_SPREAD => Some(nin as i64),
        ARITY_MAX => None,
        n => Some(n as i64),
    }
}

/// Returns (pops, pushes) for an instruction, or None if the effect is dynamic.
fn effect(instr: Instr, program: &Program, natives: &dyn NativeArity) -> Option<(i64, i64)> {
    use Opcode::*;
    let operand = instr.operand();
    Some(match instr.opcode()? {
        Nop => (0, 0),
        PushInt | PushConst => (0, 1),
        Pop => (operand as i64, 0),
        LoadVar | LoadArg | LoadNativeVar => (0, 1),
        StoreVar | StoreArg => (1, 0),
        AddrVar => (0, 1),
        AddrOp => instr.decode_addr_op().1?.stack_effect(),
        BuiltinOp => (2, 1),
        Convert | Deref | Field => (1, 1),
        PushNative | PushNativev | Closure | HostClosure => (0, 1),

        CallFunc => {
            let func = program.fixed_func(operand)?;
            (func.num_in() as i64, func.num_out as i64)
        }
        CallFuncv => {
            let (field, index) = instr.decode_funcv();
            let func = program.variadic_func(index)?;
            (variadic_pops(field, func.num_in())?, func.num_out as i64)
        }
        CallNative => {
            let (nin, nout) = natives.func_arity(operand)?;
            (nin as i64, nout as i64)
        }
        CallNativev => {
            let (field, addr) = instr.decode_funcv();
            let (nin, nout) = natives.funcv_arity(addr)?;
            (variadic_pops(field, nin)?, nout as i64)
        }

        // Callee only known at run time.
        CallClosure | CallValue => return None,

        Return if operand == RETURN_VARS => (0, 0),
        Return => (operand as i64, 0),
    })
}

/// Check stack effects of `code` with a given initial stack height.
///
/// A linear scan: there are no jumps, so it is exact up to the first
/// instruction whose effect is dynamic, where checking stops.
pub fn check_range(
    program: &Program,
    natives: &dyn NativeArity,
    start: usize,
    end: usize,
    num_in: usize,
) -> Result<(), StackCheckError> {
    let mut h: i64 = 0;

    for ip in start..end {
        let instr = program.code[ip];
        if let Some(Opcode::LoadArg | Opcode::StoreArg) = instr.opcode() {
            let below = instr.operand() as usize;
            if below == 0 || below > num_in {
                return Err(StackCheckError::new(format!(
                    "argument slot {} out of range at ip={} ({} parameters)",
                    below, ip, num_in
                )));
            }
        }
        match effect(instr, program, natives) {
            Some((pops, pushes)) => {
                h -= pops;
                if h < 0 {
                    return Err(StackCheckError::new(format!(
                        "stack underflow at ip={}, op={}, needed {} items",
                        ip, instr, pops
                    )));
                }
                h += pushes;
                if instr.opcode() == Some(Opcode::Return) {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }

    Ok(())
}

/// Check the main body and every defined function.
pub fn check_program(program: &Program, natives: &dyn NativeArity) -> Result<(), StackCheckError> {
    if let Some(ip) =
        (0..program.main_end).find(|ip| program.code[*ip].opcode() == Some(Opcode::Return))
    {
        return Err(StackCheckError::new(format!("return in main body at ip={}", ip)));
    }
    check_range(program, natives, 0, program.main_end, 0)?;

    for func in &program.funcs {
        if let (Some(entry), Some(end)) = (func.entry, func.end) {
            check_range(program, natives, entry, end, func.num_in()).map_err(|e| {
                StackCheckError::new(format!("in function {}: {}", func.name, e.message))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::func::Var;
    use crate::bytecode::instr::SCOPE_GLOBAL;
    use crate::bytecode::op::{AddrOperator, Operator};
    use crate::bytecode::program::{Builder, CallArity};
    use crate::lang::types::{Kind, Type};
    use crate::lang::value::Value;

    fn check_main(build: impl FnOnce(&mut Builder)) -> Result<(), StackCheckError> {
        let mut b = Builder::new();
        build(&mut b);
        let end = b.len();
        let program = b.resolve(end).unwrap();
        check_program(&program, &())
    }

    #[test]
    fn test_simple_ops() {
        let result = check_main(|b| {
            b.push_value(Value::Int(1));
            b.push_value(Value::Int(2));
            b.builtin_op(Kind::Int, Operator::Add);
            b.pop(1);
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_underflow() {
        let result = check_main(|b| {
            b.push_value(Value::Int(1));
            b.builtin_op(Kind::Int, Operator::Add);
        });
        assert!(result.unwrap_err().message.contains("underflow"));
    }

    #[test]
    fn test_pop_count_underflow() {
        let result = check_main(|b| {
            b.push_value(Value::Int(1));
            b.pop(2);
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_addr_ops() {
        let balanced = check_main(|b| {
            b.define_var(None, Var::new("x", Type::INT));
            b.push_value(Value::Int(5));
            b.addr_var(SCOPE_GLOBAL, 0);
            b.addr_op(Kind::Int, AddrOperator::Assign);
            b.addr_var(SCOPE_GLOBAL, 0);
            b.addr_op(Kind::Int, AddrOperator::Inc);
            b.addr_var(SCOPE_GLOBAL, 0);
            b.addr_op(Kind::Int, AddrOperator::Val);
            b.pop(1);
        });
        assert!(balanced.is_ok());

        let short = check_main(|b| {
            b.define_var(None, Var::new("x", Type::INT));
            b.addr_var(SCOPE_GLOBAL, 0);
            b.addr_op(Kind::Int, AddrOperator::Update(Operator::Add));
        });
        assert!(short.unwrap_err().message.contains("underflow"));
    }

    #[test]
    fn test_dynamic_call_stops_analysis() {
        let result = check_main(|b| {
            b.push_value(Value::Int(1));
            b.call_value(CallArity::Count(0));
            b.pop(5);
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_unknown_native_stops_analysis() {
        let result = check_main(|b| {
            b.call_native(0);
            b.pop(3);
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_script_call_uses_declared_arity() {
        let mut b = Builder::new();
        let f = b.new_func("f", 1);
        b.push_value(Value::Int(1));
        b.call_func(f);
        b.pop(2);
        let end = b.len();
        b.args(f, vec![Type::INT]).unwrap();
        b.results(f, vec![Var::positional(0, Type::INT), Var::positional(1, Type::INT)])
            .unwrap();
        b.define_func(f).unwrap();
        b.end_func(f).unwrap();
        let program = b.resolve(end).unwrap();
        assert!(check_program(&program, &()).is_ok());
    }

    #[test]
    fn test_arg_slot_out_of_range() {
        let mut b = Builder::new();
        let f = b.new_func("f", 1);
        b.args(f, vec![Type::INT]).unwrap();
        b.define_func(f).unwrap();
        b.load_arg(2);
        b.pop(1);
        b.end_func(f).unwrap();
        let program = b.resolve(0).unwrap();
        let err = check_program(&program, &()).unwrap_err();
        assert!(err.message.contains("in function f"));
        assert!(err.message.contains("argument slot 2"));
    }

    #[test]
    fn test_return_needs_values() {
        let mut b = Builder::new();
        let f = b.new_func("f", 1);
        b.args(f, vec![]).unwrap();
        b.define_func(f).unwrap();
        b.ret(1);
        b.end_func(f).unwrap();
        let program = b.resolve(0).unwrap();
        assert!(check_program(&program, &()).is_err());
    }

    #[test]
    fn test_return_in_main_rejected() {
        let result = check_main(|b| b.ret_vars());
        assert!(result.unwrap_err().message.contains("return in main"));
    }
}
