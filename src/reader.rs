//! Reader for the Unlambda surface syntax, plus the matching
//! re-serializer.
//!
//! The grammar is flat: `` ` `` opens an application awaiting two operands;
//! the letters `i k s v d c e` (either case) are the shared nullary
//! combinators; `r` is a fresh print-newline atom; `@` and `|` are shared;
//! `.` and `?` each consume one more raw byte as their payload. `#` starts
//! a comment running to end of line, except inside a `.`/`?` payload.
//!
//! Construction is shift/reduce over a stack of pending application nodes
//! threaded through their `r` field: an arriving atom fills the top node's
//! empty `l`; a node with both children placed becomes the atom for the
//! node below it. Everything is allocated straight into the old
//! generation, so the tree never moves.

use std::fmt;
use std::io::{self, Read, Write};

use crate::gc::{Cell, CellRef, GcError, Heap, Tag};

#[derive(Debug)]
pub enum ParseError {
    /// Input ended in the middle of the program.
    UnexpectedEof { offset: usize },
    /// A byte with no meaning in the surface syntax.
    UnexpectedByte { byte: u8, offset: usize },
    Io(io::Error),
    OutOfMemory(GcError),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedEof { offset } => {
                write!(f, "unexpected end of input at byte {}", offset)
            }
            ParseError::UnexpectedByte { byte, offset } => write!(
                f,
                "unexpected character '{}' at byte {}",
                (*byte as char).escape_default(),
                offset
            ),
            ParseError::Io(e) => write!(f, "read error: {}", e),
            ParseError::OutOfMemory(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Io(e) => Some(e),
            ParseError::OutOfMemory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        ParseError::Io(e)
    }
}

impl From<GcError> for ParseError {
    fn from(e: GcError) -> Self {
        ParseError::OutOfMemory(e)
    }
}

/// Byte cursor that counts how far it has read.
struct Bytes<'a, R> {
    inner: &'a mut R,
    offset: usize,
}

impl<R: Read> Bytes<'_, R> {
    fn next(&mut self) -> Result<Option<u8>, ParseError> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(buf[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ParseError::Io(e)),
            }
        }
    }

    /// Next byte outside whitespace and `#` comments.
    fn next_token_byte(&mut self) -> Result<Option<u8>, ParseError> {
        loop {
            match self.next()? {
                Some(b'#') => {
                    while let Some(b) = self.next()? {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b) if b.is_ascii_whitespace() => continue,
                other => return Ok(other),
            }
        }
    }
}

/// Read one complete program from `input`, leaving anything after it
/// unconsumed. The tree lives in the old generation.
pub fn parse<R: Read>(heap: &mut Heap, input: &mut R) -> Result<CellRef, ParseError> {
    let consts = heap.constants();
    let mut src = Bytes { inner: input, offset: 0 };
    // Pending applications, threaded through `r`.
    let mut stack = CellRef::NIL;

    loop {
        let byte = match src.next_token_byte()? {
            Some(b) => b,
            None => return Err(ParseError::UnexpectedEof { offset: src.offset }),
        };

        let mut atom = match byte {
            b'`' => {
                stack = heap.alloc_old(Cell::binary(Tag::Ap, CellRef::NIL, stack))?;
                continue;
            }
            b'i' | b'I' => consts.i,
            b'k' | b'K' => consts.k,
            b's' | b'S' => consts.s,
            b'v' | b'V' => consts.v,
            b'd' | b'D' => consts.d,
            b'c' | b'C' => consts.c,
            b'e' | b'E' => consts.e,
            b'r' | b'R' => heap.alloc_old(Cell::byte(Tag::Dot, b'\n'))?,
            b'@' => consts.at,
            b'|' => consts.pipe,
            b'.' | b'?' => {
                // The payload is the next raw byte, whatever it is.
                let payload = match src.next()? {
                    Some(b) => b,
                    None => return Err(ParseError::UnexpectedEof { offset: src.offset }),
                };
                let tag = if byte == b'.' { Tag::Dot } else { Tag::Ques };
                heap.alloc_old(Cell::byte(tag, payload))?
            }
            other => {
                return Err(ParseError::UnexpectedByte {
                    byte: other,
                    offset: src.offset - 1,
                })
            }
        };

        // Reduce: fill the top pending node, rotating completed subtrees
        // down into the node below.
        while !stack.is_nil() {
            if heap[stack].l.is_nil() {
                heap[stack].l = atom;
                break;
            }
            let below = heap[stack].r;
            heap[stack].r = atom;
            atom = stack;
            stack = below;
        }
        if stack.is_nil() {
            return Ok(atom);
        }
    }
}

/// Emit `root` back as surface syntax: preorder, `` ` `` before each
/// application. Drives an explicit stack; program trees can be deeper than
/// the call stack allows.
///
/// Only accepts cells the reader produces; anything else is a caller bug.
pub fn write_program<W: Write>(heap: &Heap, root: CellRef, out: &mut W) -> io::Result<()> {
    let mut pending = vec![root];
    while let Some(r) = pending.pop() {
        let cell = heap[r];
        match cell.tag {
            Tag::Ap => {
                out.write_all(b"`")?;
                pending.push(cell.r);
                pending.push(cell.l);
            }
            Tag::I => out.write_all(b"i")?,
            Tag::K => out.write_all(b"k")?,
            Tag::S => out.write_all(b"s")?,
            Tag::V => out.write_all(b"v")?,
            Tag::D => out.write_all(b"d")?,
            Tag::C => out.write_all(b"c")?,
            Tag::E => out.write_all(b"e")?,
            Tag::At => out.write_all(b"@")?,
            Tag::Pipe => out.write_all(b"|")?,
            Tag::Dot => out.write_all(&[b'.', cell.ch])?,
            Tag::Ques => out.write_all(&[b'?', cell.ch])?,
            other => panic!("write_program: {:?} is not a program cell", other),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(heap: &mut Heap, src: &str) -> Result<CellRef, ParseError> {
        parse(heap, &mut src.as_bytes())
    }

    /// Structural equality over program trees, without recursion.
    fn trees_equal(heap: &Heap, a: CellRef, b: CellRef) -> bool {
        let mut pending = vec![(a, b)];
        while let Some((a, b)) = pending.pop() {
            let (ca, cb) = (heap[a], heap[b]);
            if ca.tag != cb.tag || ca.ch != cb.ch {
                return false;
            }
            if ca.tag == Tag::Ap {
                pending.push((ca.l, cb.l));
                pending.push((ca.r, cb.r));
            }
        }
        true
    }

    #[test]
    fn single_combinator_is_the_shared_cell() {
        let mut heap = Heap::default_heap();
        let root = parse_str(&mut heap, "i").expect("parse");
        assert_eq!(root, heap.constants().i);
    }

    #[test]
    fn application_tree_structure() {
        let mut heap = Heap::default_heap();
        let root = parse_str(&mut heap, "`.HI").expect("parse");
        let cell = heap[root];
        assert_eq!(cell.tag, Tag::Ap);
        assert_eq!(heap[cell.l].tag, Tag::Dot);
        assert_eq!(heap[cell.l].ch, b'H');
        assert_eq!(cell.r, heap.constants().i);
    }

    #[test]
    fn nested_applications_associate_by_prefix() {
        let mut heap = Heap::default_heap();
        // ``ksv = (k s) v, not k (s v).
        let root = parse_str(&mut heap, "``ksv").expect("parse");
        let outer = heap[root];
        assert_eq!(outer.tag, Tag::Ap);
        assert_eq!(outer.r, heap.constants().v);
        let inner = heap[outer.l];
        assert_eq!(inner.tag, Tag::Ap);
        assert_eq!(inner.l, heap.constants().k);
        assert_eq!(inner.r, heap.constants().s);
    }

    #[test]
    fn letters_are_case_insensitive() {
        let mut heap = Heap::default_heap();
        let lower = parse_str(&mut heap, "``ksv").expect("parse");
        let upper = parse_str(&mut heap, "``KSV").expect("parse");
        assert!(trees_equal(&heap, lower, upper));
    }

    #[test]
    fn nullary_combinators_are_deduplicated() {
        let mut heap = Heap::default_heap();
        let root = parse_str(&mut heap, "`kk").expect("parse");
        assert_eq!(heap[root].l, heap[root].r);
    }

    #[test]
    fn r_is_a_fresh_newline_print() {
        let mut heap = Heap::default_heap();
        let root = parse_str(&mut heap, "`rr").expect("parse");
        let cell = heap[root];
        assert_ne!(cell.l, cell.r, "each r must be its own cell");
        assert_eq!(heap[cell.l].tag, Tag::Dot);
        assert_eq!(heap[cell.l].ch, b'\n');
        assert_eq!(heap[cell.r].ch, b'\n');
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        let mut heap = Heap::default_heap();
        let root = parse_str(&mut heap, "` # apply\n  i\tk").expect("parse");
        let cell = heap[root];
        assert_eq!(cell.l, heap.constants().i);
        assert_eq!(cell.r, heap.constants().k);
    }

    #[test]
    fn payload_bytes_are_raw() {
        let mut heap = Heap::default_heap();
        // `.` takes the very next byte, even whitespace or `#`.
        let root = parse_str(&mut heap, "`. i").expect("parse");
        assert_eq!(heap[heap[root].l].ch, b' ');

        let root = parse_str(&mut heap, "`?#i").expect("parse");
        let ques = heap[heap[root].l];
        assert_eq!(ques.tag, Tag::Ques);
        assert_eq!(ques.ch, b'#');
    }

    #[test]
    fn parsing_stops_after_a_complete_program() {
        let mut heap = Heap::default_heap();
        let mut input = "ik".as_bytes();
        let root = parse(&mut heap, &mut input).expect("parse");
        assert_eq!(root, heap.constants().i);
        assert_eq!(input, b"k", "trailing input must stay unread");
    }

    #[test]
    fn eof_inside_payload_is_an_error() {
        let mut heap = Heap::default_heap();
        let err = parse_str(&mut heap, "`i.").expect_err("must fail");
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn eof_mid_expression_is_an_error() {
        let mut heap = Heap::default_heap();
        for src in ["", "`", "`i", "``ks"] {
            let err = parse_str(&mut heap, src).expect_err("must fail");
            assert!(matches!(err, ParseError::UnexpectedEof { .. }), "{:?}", src);
        }
    }

    #[test]
    fn unknown_bytes_are_rejected_with_position() {
        let mut heap = Heap::default_heap();
        let err = parse_str(&mut heap, "`ix").expect_err("must fail");
        match err {
            ParseError::UnexpectedByte { byte, offset } => {
                assert_eq!(byte, b'x');
                assert_eq!(offset, 2);
            }
            other => panic!("wrong error: {}", other),
        }
    }

    #[test]
    fn heap_limit_surfaces_as_out_of_memory() {
        use crate::gc::HeapConfig;
        let mut heap = Heap::new(HeapConfig {
            young_size: 64,
            chunk_size: 64,
            max_old_cells: 64,
        });
        // More nodes than one chunk holds: 60 applications, 61 fresh atoms.
        let src = format!("{}{}", "`".repeat(60), "r".repeat(61));
        let err = parse_str(&mut heap, &src).expect_err("must exhaust the heap");
        assert!(matches!(err, ParseError::OutOfMemory(_)));
    }

    #[test]
    fn round_trip_reproduces_the_tree() {
        let mut heap = Heap::default_heap();
        for src in ["```sii``sii", "``?a|r", "``d`.Xii", "`c`.A`e@"] {
            let first = parse_str(&mut heap, src).expect("parse");
            let mut emitted = Vec::new();
            write_program(&heap, first, &mut emitted).expect("serialize");
            let second =
                parse(&mut heap, &mut emitted.as_slice()).expect("reparse of emitted program");
            assert!(
                trees_equal(&heap, first, second),
                "{:?} -> {:?} did not round-trip",
                src,
                String::from_utf8_lossy(&emitted)
            );
        }
    }
}
