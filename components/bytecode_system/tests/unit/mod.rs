//! Unit tests for bytecode_system

mod test_code;
mod test_opcode;
