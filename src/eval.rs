//! The evaluator: an explicit continuation-passing state machine.
//!
//! Four registers drive the loop: `val` (expression under evaluation or the
//! latest result), `op` (operator picked in an apply step), and the top
//! continuation frame held outside the heap as `task`/`task_val`. The rest
//! of the continuation lives on the heap as a spine of frame cells reached
//! through `next_cont`, which is what makes `c` (call/cc) a pointer copy
//! and `e` (exit) a register write.
//!
//! The machine allocates at three kinds of points, and each is a GC
//! safepoint: before every left-spine descent step, on entry to apply, and
//! before a frame pop (the `EVAL_RIGHT` handlers build a `D1` when the
//! operator turned out to be `d`). At a safepoint the live registers are
//! handed to the collector as roots and read back moved.

use std::fmt;
use std::io::{self, Read, Write};

use crate::gc::{Cell, CellRef, GcError, Heap, Tag};

#[derive(Debug)]
pub enum EvalError {
    OutOfMemory(GcError),
    Io(io::Error),
    /// `apply` dispatched on a tag that is not an operator.
    InvalidOperator(Tag),
    /// A pop found a tag that is not a continuation frame.
    InvalidFrame(Tag),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::OutOfMemory(e) => e.fmt(f),
            EvalError::Io(e) => write!(f, "i/o error: {}", e),
            EvalError::InvalidOperator(tag) => {
                write!(f, "internal error: {:?} applied as an operator", tag)
            }
            EvalError::InvalidFrame(tag) => {
                write!(f, "internal error: {:?} popped as a continuation frame", tag)
            }
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvalError::OutOfMemory(e) => Some(e),
            EvalError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GcError> for EvalError {
    fn from(e: GcError) -> Self {
        EvalError::OutOfMemory(e)
    }
}

impl From<io::Error> for EvalError {
    fn from(e: io::Error) -> Self {
        EvalError::Io(e)
    }
}

/// What the main loop does next.
enum State {
    /// Walk `val`'s left spine down to its leftmost atom.
    Eval,
    /// Dispatch on the current frame in `task`/`task_val`.
    PopFrame,
    /// Apply the operator in `op` to the value in `val`.
    Apply,
}

/// The evaluator with its I/O endpoints and the single current-byte
/// register shared by `@`, `?x` and `|`. EOF is `None`, never equal to any
/// byte.
pub struct Machine<R, W> {
    input: R,
    output: W,
    current: Option<u8>,
}

impl<R: Read, W: Write> Machine<R, W> {
    pub fn new(input: R, output: W) -> Machine<R, W> {
        Machine {
            input,
            output,
            current: None,
        }
    }

    /// Run `program` to completion and return the final value. The output
    /// is flushed before returning.
    pub fn run(&mut self, heap: &mut Heap, program: CellRef) -> Result<CellRef, EvalError> {
        let consts = heap.constants();
        let mut val = program;
        let mut op = CellRef::NIL;
        let mut task = Tag::Exit;
        let mut task_val = CellRef::NIL;
        let mut next_cont = CellRef::NIL;
        let mut state = State::Eval;

        loop {
            state = match state {
                State::Eval => {
                    while heap[val].tag == Tag::Ap {
                        safepoint(heap, 1, &mut val, &mut op, &mut task_val, &mut next_cont)?;
                        let cell = heap[val];
                        next_cont = heap.alloc_young(Cell::binary(task, next_cont, task_val));
                        task = Tag::EvalRight;
                        task_val = cell.r;
                        val = cell.l;
                    }
                    State::PopFrame
                }

                State::PopFrame => match task {
                    Tag::Exit => {
                        self.output.flush()?;
                        return Ok(val);
                    }
                    Tag::EvalRight => {
                        safepoint(heap, 1, &mut val, &mut op, &mut task_val, &mut next_cont)?;
                        if heap[val].tag == Tag::D {
                            // The whole application is frozen: keep the
                            // operand unevaluated.
                            val = heap.alloc_young(Cell::unary(Tag::D1, task_val));
                            pop_frame(heap, &mut task, &mut task_val, &mut next_cont);
                            State::PopFrame
                        } else {
                            let rand = task_val;
                            task = Tag::Apply;
                            task_val = val;
                            val = rand;
                            State::Eval
                        }
                    }
                    Tag::EvalRightS => {
                        safepoint(heap, 1, &mut val, &mut op, &mut task_val, &mut next_cont)?;
                        if heap[val].tag == Tag::D {
                            val = heap.alloc_young(Cell::unary(Tag::D1, task_val));
                            pop_frame(heap, &mut task, &mut task_val, &mut next_cont);
                            State::PopFrame
                        } else {
                            // Both halves of the pair are already values;
                            // skip re-evaluation.
                            let pair = task_val;
                            task = Tag::Apply;
                            task_val = val;
                            op = heap[pair].l;
                            val = heap[pair].r;
                            State::Apply
                        }
                    }
                    Tag::Apply => {
                        op = task_val;
                        pop_frame(heap, &mut task, &mut task_val, &mut next_cont);
                        State::Apply
                    }
                    Tag::ApplyT => {
                        op = val;
                        val = task_val;
                        pop_frame(heap, &mut task, &mut task_val, &mut next_cont);
                        State::Apply
                    }
                    other => return Err(EvalError::InvalidFrame(other)),
                },

                State::Apply => {
                    safepoint(heap, 2, &mut val, &mut op, &mut task_val, &mut next_cont)?;
                    match heap[op].tag {
                        Tag::I => State::PopFrame,
                        Tag::Dot => {
                            self.output.write_all(&[heap[op].ch])?;
                            State::PopFrame
                        }
                        Tag::K => {
                            val = heap.alloc_young(Cell::unary(Tag::K1, val));
                            State::PopFrame
                        }
                        Tag::K1 => {
                            val = heap[op].l;
                            State::PopFrame
                        }
                        Tag::S => {
                            // `S (K a)` composes: build `B1 a` instead.
                            val = if heap[val].tag == Tag::K1 {
                                heap.alloc_young(Cell::unary(Tag::B1, heap[val].l))
                            } else {
                                heap.alloc_young(Cell::unary(Tag::S1, val))
                            };
                            State::PopFrame
                        }
                        Tag::S1 => {
                            val = if heap[val].tag == Tag::K1 {
                                // `S f (K a)`: the second argument is
                                // constant, so specialize on f.
                                let f = heap[op].l;
                                let a = heap[val].l;
                                match heap[f].tag {
                                    Tag::I => heap.alloc_young(Cell::unary(Tag::T1, a)),
                                    Tag::T1 => {
                                        heap.alloc_young(Cell::binary(Tag::V2, heap[f].l, a))
                                    }
                                    _ => heap.alloc_young(Cell::binary(Tag::C2, f, a)),
                                }
                            } else {
                                heap.alloc_young(Cell::binary(Tag::S2, heap[op].l, val))
                            };
                            State::PopFrame
                        }
                        Tag::B1 => {
                            val = heap.alloc_young(Cell::binary(Tag::B2, heap[op].l, val));
                            State::PopFrame
                        }
                        Tag::T1 => {
                            // T x y = y x: swap and keep applying.
                            let x = heap[op].l;
                            op = val;
                            val = x;
                            State::Apply
                        }
                        Tag::S2 => {
                            // S f g x = f x (g x). Evaluate `f x` first;
                            // `g` and `x` are values already, so the pending
                            // `g x` skips re-evaluation when popped.
                            let pair =
                                heap.alloc_young(Cell::binary(Tag::Ap, heap[op].r, val));
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::EvalRightS;
                            task_val = pair;
                            op = heap[op].l;
                            State::Apply
                        }
                        Tag::B2 => {
                            if heap[heap[op].l].tag == Tag::D {
                                // B d g x: keep `g x` frozen without
                                // materializing the application.
                                let ap =
                                    heap.alloc_young(Cell::binary(Tag::Ap, heap[op].r, val));
                                val = heap.alloc_young(Cell::unary(Tag::D1, ap));
                                State::PopFrame
                            } else {
                                next_cont =
                                    heap.alloc_young(Cell::binary(task, next_cont, task_val));
                                task = Tag::Apply;
                                task_val = heap[op].l;
                                op = heap[op].r;
                                State::Apply
                            }
                        }
                        Tag::C2 => {
                            // C f g x = (f x) g.
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::ApplyT;
                            task_val = heap[op].r;
                            op = heap[op].l;
                            State::Apply
                        }
                        Tag::V2 => {
                            // V x y z = (z x) y.
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::ApplyT;
                            task_val = heap[op].r;
                            let x = heap[op].l;
                            op = val;
                            val = x;
                            State::Apply
                        }
                        Tag::V => {
                            val = op;
                            State::PopFrame
                        }
                        Tag::D => {
                            val = heap.alloc_young(Cell::unary(Tag::D1, val));
                            State::PopFrame
                        }
                        Tag::D1 => {
                            // Force the delayed term, then apply its result
                            // to the argument.
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::ApplyT;
                            task_val = val;
                            val = heap[op].l;
                            State::Eval
                        }
                        Tag::C => {
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::Apply;
                            task_val = val;
                            val = heap.alloc_young(Cell::unary(Tag::Cont, next_cont));
                            State::PopFrame
                        }
                        Tag::Cont => {
                            // Replace the live spine with the captured one.
                            next_cont = heap[op].l;
                            pop_frame(heap, &mut task, &mut task_val, &mut next_cont);
                            State::PopFrame
                        }
                        Tag::E => {
                            task = Tag::Exit;
                            State::PopFrame
                        }
                        Tag::At => {
                            self.current = self.read_byte();
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::Apply;
                            task_val = val;
                            val = if self.current.is_some() { consts.i } else { consts.v };
                            State::PopFrame
                        }
                        Tag::Ques => {
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::Apply;
                            task_val = val;
                            val = if self.current == Some(heap[op].ch) {
                                consts.i
                            } else {
                                consts.v
                            };
                            State::PopFrame
                        }
                        Tag::Pipe => {
                            next_cont =
                                heap.alloc_young(Cell::binary(task, next_cont, task_val));
                            task = Tag::Apply;
                            task_val = val;
                            val = match self.current {
                                Some(b) => heap.alloc_young(Cell::byte(Tag::Dot, b)),
                                None => consts.v,
                            };
                            State::PopFrame
                        }
                        other => return Err(EvalError::InvalidOperator(other)),
                    }
                }
            };
        }
    }

    /// Read one byte; EOF and read failure both yield `None`, matching the
    /// byte-or-EOF contract of the language's input operators.
    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return None,
                Ok(_) => return Some(buf[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Hand the registers to the collector when the nursery lacks `n` cells.
fn safepoint(
    heap: &mut Heap,
    n: usize,
    val: &mut CellRef,
    op: &mut CellRef,
    task_val: &mut CellRef,
    next_cont: &mut CellRef,
) -> Result<(), GcError> {
    if !heap.young_has(n) {
        let mut roots = [*val, *op, *task_val, *next_cont];
        heap.ensure_young(n, &mut roots)?;
        *val = roots[0];
        *op = roots[1];
        *task_val = roots[2];
        *next_cont = roots[3];
    }
    Ok(())
}

/// Pop the top heap frame into the `task`/`task_val` registers.
fn pop_frame(heap: &Heap, task: &mut Tag, task_val: &mut CellRef, next_cont: &mut CellRef) {
    debug_assert!(!next_cont.is_nil(), "popping past the exit frame");
    let frame = heap[*next_cont];
    *task = frame.tag;
    *task_val = frame.r;
    *next_cont = frame.l;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::HeapConfig;
    use crate::reader;

    /// Parse and run `program` against `input`, returning the output bytes.
    fn run_program(program: &str, input: &[u8]) -> Vec<u8> {
        run_in_heap(&mut Heap::default_heap(), program, input)
    }

    fn run_in_heap(heap: &mut Heap, program: &str, input: &[u8]) -> Vec<u8> {
        let root = reader::parse(heap, &mut program.as_bytes()).expect("program should parse");
        let mut out = Vec::new();
        Machine::new(input, &mut out)
            .run(heap, root)
            .expect("program should run");
        out
    }

    #[test]
    fn identity_passes_its_argument_through() {
        // `i .H applied to i: i leaves .H alone, which then prints.
        assert_eq!(run_program("``i.Hi", b""), b"H");
    }

    #[test]
    fn k_keeps_the_first_argument() {
        assert_eq!(run_program("```k.A.Bi", b""), b"A");
    }

    #[test]
    fn s_applies_left_before_right() {
        // S f g x = f x (g x); f's effect must come first.
        assert_eq!(run_program("```s.A.Bi", b""), b"AB");
    }

    #[test]
    fn b_rewrite_matches_direct_composition() {
        // ``s`k.A ≡ B .A, and B f g x = f (g x).
        assert_eq!(run_program("```s`k.A.Bi", b""), b"BA");
        assert_eq!(run_program("`.A`.Bi", b""), b"BA");
    }

    #[test]
    fn c_rewrite_matches_direct_application() {
        // ``s.A`k.B ≡ C .A .B, and C f g x = (f x) g.
        assert_eq!(run_program("````s.A`k.Bii", b""), b"AB");
        assert_eq!(run_program("```.Ai.Bi", b""), b"AB");
    }

    #[test]
    fn t_rewrite_swaps_its_arguments() {
        // ``si`k.A ≡ T .A, and T x y = y x.
        assert_eq!(run_program("```si`k.A.B", b""), b"B");
        assert_eq!(run_program("`.B.A", b""), b"B");
    }

    #[test]
    fn v_rewrite_matches_direct_application() {
        // ``s``si`k.A`k.B ≡ V .A .B, and V x y z = (z x) y.
        assert_eq!(run_program("```s``si`k.A`k.B.C", b""), b"CA");
        assert_eq!(run_program("``.C.A.B", b""), b"CA");
    }

    #[test]
    fn d_delays_and_application_forces() {
        // The delayed `.A i is never forced...
        assert_eq!(run_program("`d`.Ai", b""), b"");
        // ...until the promise is applied.
        assert_eq!(run_program("``d`.Aii", b""), b"A");
    }

    #[test]
    fn b2_with_d_operator_stays_lazy() {
        // ``s`kd builds B2 with a d operator; applying it must freeze
        // `g x` instead of forcing it.
        assert_eq!(run_program("```s`kd.Xi", b""), b"");
        assert_eq!(run_program("````s`kd.Xii", b""), b"X");
    }

    #[test]
    fn v_absorbs_but_operands_still_evaluate() {
        assert_eq!(run_program("``v.Ai", b""), b"");
        assert_eq!(run_program("``v`.Aii", b""), b"A");
    }

    #[test]
    fn call_cc_passes_the_continuation() {
        // The reified continuation flows into .A once.
        assert_eq!(run_program("`c.A", b""), b"A");
        assert_eq!(run_program("`ci", b""), b"");
    }

    #[test]
    fn invoking_a_continuation_reenters_its_context() {
        // .A runs once when the continuation value flows out of `c, and
        // again when the continuation is invoked.
        assert_eq!(run_program("``.A`cii", b""), b"AA");
    }

    #[test]
    fn exit_stops_before_pending_applications() {
        let mut heap = Heap::default_heap();
        let root = reader::parse(&mut heap, &mut "`.X`ei".as_bytes()).expect("parse");
        let mut out = Vec::new();
        let result = Machine::new(&b""[..], &mut out)
            .run(&mut heap, root)
            .expect("run");
        assert_eq!(out, b"", "nothing may print after e fires");
        assert_eq!(heap[result].tag, Tag::I);
    }

    #[test]
    fn at_reads_and_pipe_reprints() {
        assert_eq!(run_program("```@i`|ii", b"Q"), b"Q");
        assert_eq!(run_program("```@i`|ii", b""), b"");
    }

    #[test]
    fn ques_compares_against_the_current_byte() {
        let matches_q = "```@i``?Qi.Yi";
        assert_eq!(run_program(matches_q, b"Q"), b"Y");
        assert_eq!(run_program(matches_q, b"Z"), b"");
        // EOF never equals any byte.
        assert_eq!(run_program(matches_q, b""), b"");
    }

    #[test]
    fn collections_do_not_perturb_output() {
        // A long right-nested chain of prints: deep spine, lots of frame
        // allocation. A tiny nursery forces constant collection.
        let mut program = String::new();
        for _ in 0..500 {
            program.push_str("`.A");
        }
        program.push('i');

        let expected = run_program(&program, b"");
        assert_eq!(expected, vec![b'A'; 500]);

        let mut heap = Heap::new(HeapConfig {
            young_size: 32,
            chunk_size: 4096,
            max_old_cells: usize::MAX,
        });
        let squeezed = run_in_heap(&mut heap, &program, b"");
        assert_eq!(squeezed, expected);
        assert!(heap.stats.minor_collections > 0, "the nursery must have cycled");
    }

    #[test]
    fn continuations_survive_collections() {
        // The continuation sits in a frame while a deep chain of prints
        // runs, so it gets copied (and promoted) many times before it is
        // finally invoked; invoking it re-enters the chain's frame and the
        // whole chain runs again.
        let mut program = String::from("``.A`ci");
        for _ in 0..100 {
            program.push_str("`.B");
        }
        program.push('i');

        let mut expected = vec![b'A'];
        expected.extend(std::iter::repeat(b'B').take(100));
        expected.push(b'A');
        expected.extend(std::iter::repeat(b'B').take(100));

        assert_eq!(run_program(&program, b""), expected);

        let mut heap = Heap::new(HeapConfig {
            young_size: 32,
            chunk_size: 4096,
            max_old_cells: usize::MAX,
        });
        assert_eq!(run_in_heap(&mut heap, &program, b""), expected);
        assert!(heap.stats.minor_collections > 0);
    }

    #[test]
    fn applying_a_non_operator_is_an_internal_error() {
        let mut heap = Heap::default_heap();
        let consts = heap.constants();
        let bogus = heap
            .alloc_old(Cell::nullary(Tag::Free))
            .expect("old allocation");
        let root = heap
            .alloc_old(Cell::binary(Tag::Ap, bogus, consts.i))
            .expect("old allocation");
        let mut out = Vec::new();
        let err = Machine::new(&b""[..], &mut out)
            .run(&mut heap, root)
            .expect_err("a Free operator must be rejected");
        assert!(matches!(err, EvalError::InvalidOperator(Tag::Free)));
    }
}
