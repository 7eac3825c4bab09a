use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;

/// Value stack shared by every frame of one execution.
#[derive(Debug, Default)]
pub struct Stack {
    data: Vec<Value>,
    pub(crate) depth: usize,
    pub(crate) steps: usize,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            data: Vec::with_capacity(256),
            depth: 0,
            steps: 0,
        }
    }

    /// An empty stack whose call depth starts at `depth`.
    pub(crate) fn with_depth(depth: usize) -> Self {
        Stack {
            depth,
            ..Stack::new()
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.data.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.data
            .pop()
            .ok_or_else(|| RuntimeError::stack_underflow("pop"))
    }

    /// Pop the top `n` values, returned bottom first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if n > self.data.len() {
            return Err(RuntimeError::stack_underflow(format!("pop of {} values", n)));
        }
        let at = self.data.len() - n;
        Ok(self.data.split_off(at))
    }

    pub fn get(&self, index: usize) -> Result<&Value, RuntimeError> {
        self.data
            .get(index)
            .ok_or_else(|| RuntimeError::stack_underflow(format!("read of slot {}", index)))
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        match self.data.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::stack_underflow(format!(
                "write of slot {}",
                index
            ))),
        }
    }

    /// Move the top `n` values down to `at`, dropping everything in between.
    pub fn ret(&mut self, at: usize, n: usize) -> Result<(), RuntimeError> {
        let len = self.data.len();
        if n > len || at > len - n {
            return Err(RuntimeError::stack_underflow("return"));
        }
        self.data.drain(at..len - n);
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_n_keeps_order() {
        let mut s = Stack::new();
        for i in 0..4 {
            s.push(Value::Int(i));
        }
        assert_eq!(s.pop_n(2).unwrap(), vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(s.len(), 2);
        assert!(s.pop_n(3).is_err());
    }

    #[test]
    fn test_ret_moves_results_down() {
        let mut s = Stack::new();
        for i in 0..5 {
            s.push(Value::Int(i));
        }
        s.ret(1, 2).unwrap();
        assert_eq!(s.into_vec(), vec![Value::Int(0), Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn test_ret_underflow() {
        let mut s = Stack::new();
        s.push(Value::Int(1));
        assert!(s.ret(1, 1).is_err());
        assert!(s.ret(0, 2).is_err());
    }

    #[test]
    fn test_pop_empty_is_error() {
        let mut s = Stack::new();
        assert!(s.pop().is_err());
        assert!(s.get(0).is_err());
        assert!(s.set(0, Value::Nil).is_err());
    }
}
