//! Interpreter for Unlambda, a combinator language with first-class
//! continuations, the lazy `d` operator, and byte-oriented I/O.
//!
//! The crate is organized bottom-up:
//!
//! - [`gc`] — cell arena and generational garbage collector (copying
//!   nursery, mark–sweep old generation).
//! - [`reader`] — parser for the surface syntax, plus a re-serializer.
//! - [`eval`] — the continuation-passing evaluator state machine.
//!
//! A program is parsed into an application tree of heap cells and then run:
//!
//! ```
//! use unlam::gc::Heap;
//! use unlam::{eval::Machine, reader};
//!
//! let mut heap = Heap::default_heap();
//! let program = reader::parse(&mut heap, &mut "`.Hi".as_bytes()).unwrap();
//! let mut out = Vec::new();
//! Machine::new(&b""[..], &mut out).run(&mut heap, program).unwrap();
//! assert_eq!(out, b"H");
//! ```

pub mod eval;
pub mod gc;
pub mod reader;

pub use eval::{EvalError, Machine};
pub use gc::{Heap, HeapConfig};
pub use reader::ParseError;
