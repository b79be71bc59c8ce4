pub use tokio_modbus::{Address, Quantity};

/// 16-bit value stored in Modbus register.
pub type Word = u16;

/// Single coil or discrete input surfaced as `0` or `1`.
pub type Flag = u8;

/// Largest number of coils or discrete inputs accepted in one read.
pub const MAX_BITS_PER_READ: Quantity = 200;

/// Largest number of holding or input registers accepted in one read.
pub const MAX_WORDS_PER_READ: Quantity = 125;

/// Convert coil states into `0|1` flags.
pub fn flags_from_bits(bits: &[bool]) -> Vec<Flag> {
    bits.iter().map(|&bit| Flag::from(bit)).collect()
}

/// Widen `0|1` flags into words so bit and register samples share one shape.
pub fn words_from_flags(flags: &[Flag]) -> Vec<Word> {
    flags.iter().copied().map(Word::from).collect()
}
