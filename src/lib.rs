//! `ike` is an assembler for hand-written stack VM bytecode listings, with a reference executor.
//!
//! A listing is written as the body of an ordinary procedure declaration, one instruction per statement:
//!
//! ```text
//! def fib(n):
//!     LOAD_FAST @ n
//!     LOAD_CONST @ 2
//!     COMPARE_OP @ "<"
//!     POP_JUMP_IF_FALSE @ RECURSE
//!     LOAD_FAST @ n
//!     RETURN_VALUE
//!
//!     LOAD_GLOBAL @ fib << RECURSE
//!     ...
//! ```
//!
//! The assembler ([`bytecode::assemble`]) builds the symbol pools, resolves labels, encodes the instruction
//! stream and derives the metadata of the resulting [`CodeUnit`](bytecode::CodeUnit): stack size, flags and line table.
//! A [`Namespace`](procedure::Namespace) installs assembled procedures under their names, after which they can be
//! called or iterated through the [`Process`](process::Process) executor.
//!
//! This crate is `no_std` (with `alloc`). The `std` feature adds disassembly dumps and [`std::error::Error`] impls,
//! and the `cli` feature (default) builds the `ike` command line tool.

#![forbid(unsafe_code)]
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

/// Meta data generated by the build script.
mod meta {
    include!(concat!(env!("OUT_DIR"), "/meta.rs"));
}

#[cfg(test)]
mod test;

pub mod util;
pub mod opcode;
pub mod runtime;
pub mod expr;
pub mod source;
pub mod bytecode;
pub mod procedure;
pub mod process;

#[cfg(feature = "cli")]
pub mod cli;
