//! # Quill Language Model
//!
//! The front-end facing half of the crate: the syntax tree a parser hands
//! over, literal conversion, and the types and values shared by the
//! compiler and the VM.
//!
//! ## Conventions
//!
//! - A `Kind` is the flat tag used in instruction operands; a `Type` is the
//!   full descriptor (slices, pointers, structs, functions, named types).
//! - Constants are `Constant` until a context binds them to a `Value`.

pub mod ast;
pub mod literal;
pub mod types;
pub mod value;
