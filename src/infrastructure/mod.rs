pub mod bolt11;
pub mod in_memory;
pub mod stream;
