//! Memory sources for fiber stacks.

pub mod stack_arena;

pub use stack_arena::StackArena;
